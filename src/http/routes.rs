use axum::Json;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};

use crate::alloc::strategy::Strategy;
use crate::error::AppError;
use crate::http::AppState;
use crate::http::types::{
    AllocRequest, AllocResponse, FreeRequest, FreeResponse, HealthResponse, StrategyBody,
    StrategySetRequest,
};
use crate::metrics::counters::bump;
use crate::metrics::snapshot::MetricsSnapshot;

pub async fn alloc(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<AllocRequest>,
) -> Result<Json<AllocResponse>, AppError> {
    if state.rate_limit_enabled {
        let key = client_key(&headers);
        if !state.limiter.admit(&key) {
            bump(&state.counters.rate_limited);
            tracing::debug!(client = %key, "allocation rejected by rate limiter");
            return Err(AppError::RateLimited);
        }
    }

    let lease = state
        .allocator
        .allocate(&body.request_id, body.token_count)
        .await?;

    Ok(Json(AllocResponse {
        node_id: lease.node_id,
        remaining_quota: lease.remaining,
    }))
}

pub async fn free(
    State(state): State<AppState>,
    Json(body): Json<FreeRequest>,
) -> Result<Json<FreeResponse>, AppError> {
    let released = state.allocator.free(&body.request_id).await?;
    Ok(Json(FreeResponse {
        node_id: released.node_id,
    }))
}

pub async fn metrics(
    State(state): State<AppState>,
) -> Result<Json<MetricsSnapshot>, AppError> {
    let snapshot = state.metrics.snapshot().await?;
    Ok(Json(snapshot))
}

pub async fn strategy_get(State(state): State<AppState>) -> Json<StrategyBody> {
    Json(StrategyBody {
        strategy: state.strategy.get(),
    })
}

pub async fn strategy_set(
    State(state): State<AppState>,
    Json(body): Json<StrategySetRequest>,
) -> Result<Json<StrategyBody>, AppError> {
    let strategy = body.strategy.parse::<Strategy>().map_err(AppError::Invalid)?;

    state.strategy.set(strategy);
    tracing::info!(%strategy, "placement strategy switched");
    Ok(Json(StrategyBody { strategy }))
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    match state.repo.ping().await {
        Ok(()) => (StatusCode::OK, Json(HealthResponse { status: "ok" })),
        Err(err) => {
            tracing::warn!(error = ?err, "health probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse { status: "unavailable" }),
            )
        }
    }
}

/// Client identity for admission control: the first hop of
/// `x-forwarded-for` when a proxy provides it, else a shared bucket.
fn client_key(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn client_key_prefers_first_forwarded_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        assert_eq!(client_key(&headers), "203.0.113.9");
    }

    #[test]
    fn client_key_falls_back_without_header() {
        assert_eq!(client_key(&HeaderMap::new()), "unknown");
    }
}
