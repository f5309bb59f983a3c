pub mod routes;
pub mod types;

use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::json;

use crate::alloc::engine::Allocator;
use crate::alloc::strategy::StrategyCell;
use crate::error::AppError;
use crate::metrics::counters::Counters;
use crate::metrics::snapshot::MetricsService;
use crate::node::repository::NodeRepository;
use crate::ratelimit::RateLimiter;

#[derive(Clone)]
pub struct AppState {
    pub allocator: Arc<Allocator>,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<MetricsService>,
    pub strategy: Arc<StrategyCell>,
    pub repo: Arc<dyn NodeRepository>,
    pub counters: Counters,
    pub rate_limit_enabled: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/alloc", post(routes::alloc))
        .route("/free", post(routes::free))
        .route("/metrics", get(routes::metrics))
        .route("/strategy", get(routes::strategy_get).post(routes::strategy_set))
        .route("/health", get(routes::health))
        .with_state(state)
}

/// Status-code mapping for the error surface. Everything except `Internal`
/// is an expected client-visible condition and logs at debug level at most.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AppError::Invalid(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            AppError::RateLimited => {
                (StatusCode::TOO_MANY_REQUESTS, json!({ "error": "rate_limited" }))
            }
            AppError::Overloaded => {
                (StatusCode::TOO_MANY_REQUESTS, json!({ "error": "overloaded" }))
            }
            AppError::NotFound => (StatusCode::NOT_FOUND, json!({ "error": "not_found" })),
            AppError::Internal(err) => {
                tracing::error!(error = ?err, "internal error reached the http boundary");
                (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": "internal" }))
            }
        };

        (status, axum::Json(body)).into_response()
    }
}
