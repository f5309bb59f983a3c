use std::time::Duration;

use tracing::{Span, field};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

pub fn init_tracing(json: bool) {
    // sqlx logs every statement at info; the allocation spans already carry
    // the interesting detail, so the driver is held to warnings by default.
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    let base = fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        // Includes timing when an allocation span closes
        .with_span_events(fmt::format::FmtSpan::CLOSE);

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(base.json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(base.pretty())
            .init();
    }
}

/// Fills in the `node_id` field of the current allocation span once the
/// placement is known. The span declares the field empty at entry.
pub fn annotate_placement(node_id: i64) {
    Span::current().record("node_id", field::display(node_id));
}

/// Wraps a store call and warns when it exceeds its latency budget, tagged
/// with the request it served.
pub async fn warn_if_slow<F, T>(op: &'static str, request_id: &str, max: Duration, fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    let start = std::time::Instant::now();
    let out = fut.await;
    let elapsed = start.elapsed();
    if elapsed > max {
        tracing::warn!(
            target: "performance",
            op,
            request_id = %request_id,
            elapsed_ms = elapsed.as_millis() as u64,
            "slow store operation"
        );
    }
    out
}
