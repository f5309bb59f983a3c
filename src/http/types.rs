use serde::{Deserialize, Serialize};

use crate::alloc::strategy::Strategy;

/// Allocation request.
///
/// `request_id` is the idempotency key: a repeat returns the original
/// reservation's body unchanged, even when `token_count` differs from the
/// first submission. The second call never changes state.
#[derive(Debug, Deserialize)]
pub struct AllocRequest {
    pub request_id: String,
    pub token_count: i64,
}

#[derive(Debug, Serialize)]
pub struct AllocResponse {
    pub node_id: i64,
    pub remaining_quota: i64,
}

#[derive(Debug, Deserialize)]
pub struct FreeRequest {
    pub request_id: String,
}

#[derive(Debug, Serialize)]
pub struct FreeResponse {
    pub node_id: i64,
}

/// Strategy switch request. The value arrives as a raw string and is
/// validated against the known strategies at the boundary, so an unknown
/// name is an invalid request rather than a deserialization failure.
#[derive(Debug, Deserialize)]
pub struct StrategySetRequest {
    pub strategy: String,
}

#[derive(Debug, Serialize)]
pub struct StrategyBody {
    pub strategy: Strategy,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}
