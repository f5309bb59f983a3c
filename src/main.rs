use std::sync::Arc;

use tokenpool::{
    alloc::engine::Allocator,
    alloc::strategy::StrategyCell,
    config::AppConfig,
    db::Db,
    http::{self, AppState},
    logger::init_tracing,
    metrics::counters::Counters,
    metrics::snapshot::MetricsService,
    node::repository_sqlx::SqlxNodeRepository,
    ratelimit::RateLimiter,
    seed,
};

/// Initializes the store: connects, runs migrations, constructs the
/// repository, and idempotently seeds the node pool.
async fn init_store(cfg: &AppConfig) -> anyhow::Result<Arc<SqlxNodeRepository>> {
    let db = Db::connect(
        &cfg.database_url,
        cfg.db_max_connections(),
        cfg.db_pool_timeout,
    )
    .await?;
    db.migrate().await?;

    let repo = Arc::new(SqlxNodeRepository::new(db.pool.clone(), db.dialect));

    seed::run(repo.as_ref(), cfg.nodes, cfg.node_budget).await?;

    Ok(repo)
}

/// Wires the engine, limiter, and metrics into the shared handler state.
fn build_state(cfg: &AppConfig, repo: Arc<SqlxNodeRepository>) -> AppState {
    let strategy = Arc::new(StrategyCell::new(cfg.strategy));
    let counters = Counters::default();

    let allocator = Arc::new(Allocator::new(
        repo.clone(),
        strategy.clone(),
        cfg.large_request_ratio,
        cfg.node_budget,
        cfg.alloc_max_attempts,
        counters.clone(),
    ));

    let limiter = Arc::new(RateLimiter::new(
        cfg.rate_limit_capacity,
        cfg.rate_limit_rps,
        cfg.rate_limit_max_keys,
    ));

    let metrics = Arc::new(MetricsService::new(
        repo.clone(),
        strategy.clone(),
        counters.clone(),
    ));

    AppState {
        allocator,
        limiter,
        metrics,
        strategy,
        repo,
        counters,
        rate_limit_enabled: cfg.rate_limit_enabled,
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = ?e, "failed to listen for shutdown signal");
        return;
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    sqlx::any::install_default_drivers();

    let is_production = std::env::var("APP_ENV").unwrap_or_default() == "production";
    init_tracing(is_production);

    tracing::info!("Starting tokenpool...");

    let cfg = AppConfig::from_env();

    let repo = init_store(&cfg).await?;
    let state = build_state(&cfg, repo);
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.port)).await?;
    tracing::info!(
        port = cfg.port,
        nodes = cfg.nodes,
        node_budget = cfg.node_budget,
        strategy = %cfg.strategy,
        "listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
