use thiserror::Error;

/// Allocation service error surface.
///
/// Expected store conditions (lock contention, unique collisions) never show
/// up here; the engine converts them into retries or the idempotent path.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("rate limited")]
    RateLimited,

    #[error("no node can host the request")]
    Overloaded,

    #[error("reservation not found")]
    NotFound,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
