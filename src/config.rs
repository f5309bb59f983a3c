use std::time::Duration;

use crate::alloc::strategy::Strategy;

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Database connection string. The persistence dialect (placeholder
    /// style, row-locking clause) is derived from the URL scheme.
    pub database_url: String,

    /// HTTP listen port.
    pub port: u16,

    // =========================
    // Pool topology
    // =========================
    /// Number of node rows ensured at startup.
    ///
    /// Seeding is idempotent: rows that already exist are left untouched,
    /// so restarting with a larger value only adds the missing tail.
    pub nodes: i64,

    /// Token capacity given to each node at seed time.
    ///
    /// Capacity is immutable after seeding; only `used` moves.
    pub node_budget: i64,

    // =========================
    // Placement configuration
    // =========================
    /// Initial placement strategy. Switchable at runtime through the
    /// strategy endpoint.
    pub strategy: Strategy,

    /// Fraction of `node_budget` at which a request counts as "large".
    ///
    /// Large requests are placed on the node with the most remaining
    /// capacity regardless of the active strategy, so that best-fit
    /// fragmentation cannot starve them.
    pub large_request_ratio: f64,

    /// Upper bound on placement attempts per allocation call.
    ///
    /// Each lost conditional update (another writer won the node) consumes
    /// one attempt; exhaustion is reported as overload, never as an error.
    pub alloc_max_attempts: u32,

    // =========================
    // Admission control
    // =========================
    /// Master switch for the token-bucket limiter in front of `/alloc`.
    pub rate_limit_enabled: bool,

    /// Bucket burst size per client key.
    pub rate_limit_capacity: f64,

    /// Bucket refill rate in tokens per second.
    pub rate_limit_rps: f64,

    /// Soft cap on tracked client keys; coldest keys are evicted beyond it.
    pub rate_limit_max_keys: usize,

    // =========================
    // Database pool
    // =========================
    /// Baseline pool size.
    pub db_pool_size: u32,

    /// Extra connections allowed beyond the baseline under load.
    pub db_max_overflow: u32,

    /// How long an acquire may wait before failing the request.
    pub db_pool_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://tokenpool_dev.db".to_string());

        Self {
            database_url,

            port: env_parse("PORT", 3000),

            nodes: env_parse("NODES", 2).max(0),
            node_budget: env_parse("NODE_BUDGET", 300).max(0),

            strategy: env_parse("ALLOC_STRATEGY", Strategy::Best),
            large_request_ratio: clamp_ratio(env_parse("LARGE_REQUEST_RATIO", 0.5)),
            alloc_max_attempts: env_parse("ALLOC_MAX_ATTEMPTS", 8).max(1),

            rate_limit_enabled: env_parse("RATE_LIMIT_ENABLED", true),
            rate_limit_capacity: env_parse("RATE_LIMIT_CAPACITY", 20.0_f64).max(1.0),
            rate_limit_rps: env_parse("RATE_LIMIT_RPS", 10.0_f64).max(0.0),
            rate_limit_max_keys: env_parse("RATE_LIMIT_MAX_KEYS", 10_000),

            db_pool_size: env_parse("DB_POOL_SIZE", 5),
            db_max_overflow: env_parse("DB_MAX_OVERFLOW", 10),
            db_pool_timeout: Duration::from_secs(env_parse("DB_POOL_TIMEOUT", 30)),
        }
    }

    /// Total connections the pool may open: baseline plus overflow.
    pub fn db_max_connections(&self) -> u32 {
        self.db_pool_size.saturating_add(self.db_max_overflow).max(1)
    }
}

/// Reads and parses an environment variable, falling back to `default` on
/// absence or a malformed value (logged, never fatal).
fn env_parse<T: std::str::FromStr + std::fmt::Debug>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(var = name, value = %raw, default = ?default, "malformed value; using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// The large-request threshold only makes sense as a fraction of a node's
/// budget; out-of-range values are pulled back into (0, 1].
fn clamp_ratio(v: f64) -> f64 {
    if !v.is_finite() {
        return 0.5;
    }
    v.clamp(0.01, 1.0)
}
