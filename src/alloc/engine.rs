//! Placement engine.
//!
//! Responsibilities:
//! - Validate allocation inputs against the pool's fixed ceiling.
//! - Resolve the candidate ordering once per call (strategy + large-request
//!   override) and drive bounded attempts against the gateway.
//! - Convert the two expected store races (guard miss, reservation-insert
//!   collision) into retries; everything unexpected surfaces as internal.
//!
//! Non-responsibilities:
//! - Admission control (the rate limiter runs before this engine).
//! - Transport mapping (the HTTP boundary owns status codes).
//!
//! Safety/liveness properties:
//! - Work per call is bounded by `max_attempts`.
//! - A successful return implies the reservation committed; overload implies
//!   no state change.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use crate::alloc::strategy::{StrategyCell, is_large, placement_order};
use crate::error::AppError;
use crate::logger::{annotate_placement, warn_if_slow};
use crate::metrics::counters::{Counters, bump};
use crate::node::repository::{AllocateAttempt, NodeRepository};

/// A committed allocation, echoed back on idempotent repeats.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    pub node_id: i64,
    /// The node's capacity minus its used, after this allocation committed.
    pub remaining: i64,
}

/// A released reservation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Released {
    pub node_id: i64,
}

pub struct Allocator {
    repo: Arc<dyn NodeRepository>,
    strategy: Arc<StrategyCell>,
    large_ratio: f64,
    node_budget: i64,
    max_attempts: u32,
    counters: Counters,

    /// Largest node capacity, fetched once. Capacity never changes after
    /// seeding, so the cached value cannot go stale.
    ceiling: OnceCell<Option<i64>>,
}

impl Allocator {
    pub fn new(
        repo: Arc<dyn NodeRepository>,
        strategy: Arc<StrategyCell>,
        large_ratio: f64,
        node_budget: i64,
        max_attempts: u32,
        counters: Counters,
    ) -> Self {
        Self {
            repo,
            strategy,
            large_ratio,
            node_budget,
            max_attempts: max_attempts.max(1),
            counters,
            ceiling: OnceCell::new(),
        }
    }

    /// Reserves `token_count` tokens for `request_id` on some node.
    ///
    /// Repeats with the same request_id return the original reservation
    /// unchanged, whatever token_count the repeat carries.
    #[instrument(skip(self), target = "alloc", fields(node_id = tracing::field::Empty))]
    pub async fn allocate(&self, request_id: &str, token_count: i64) -> Result<Lease, AppError> {
        if request_id.is_empty() {
            bump(&self.counters.alloc_invalid);
            return Err(AppError::Invalid("request_id must be non-empty".into()));
        }
        if token_count <= 0 {
            bump(&self.counters.alloc_invalid);
            return Err(AppError::Invalid("token_count must be positive".into()));
        }
        if let Some(max) = self.ceiling().await? {
            if token_count > max {
                bump(&self.counters.alloc_invalid);
                return Err(AppError::Invalid(format!(
                    "token_count {token_count} exceeds the largest node capacity {max}"
                )));
            }
        }

        // Read once so the ordering stays coherent for the whole call even
        // if the strategy endpoint flips it mid-flight.
        let strategy = self.strategy.get();
        let large = is_large(token_count, self.large_ratio, self.node_budget);
        let order = placement_order(strategy, large);

        for attempt in 1..=self.max_attempts {
            let outcome = warn_if_slow(
                "db_try_allocate",
                request_id,
                Duration::from_millis(250),
                async { self.repo.try_allocate(request_id, token_count, order).await },
            )
            .await
            .with_context(|| format!("allocation attempt failed for request {request_id}"))?;

            match outcome {
                AllocateAttempt::Placed { node_id, remaining } => {
                    bump(&self.counters.alloc_granted);
                    annotate_placement(node_id);
                    info!(node_id, remaining, %strategy, large, "reservation placed");
                    return Ok(Lease { node_id, remaining });
                }
                AllocateAttempt::Existing { node_id, remaining } => {
                    bump(&self.counters.alloc_idempotent);
                    annotate_placement(node_id);
                    debug!(node_id, remaining, "repeat request; returning existing reservation");
                    return Ok(Lease { node_id, remaining });
                }
                AllocateAttempt::NoCandidate => {
                    bump(&self.counters.alloc_overloaded);
                    debug!(token_count, "no node can host the request");
                    return Err(AppError::Overloaded);
                }
                AllocateAttempt::CasMiss => {
                    bump(&self.counters.alloc_retries);
                    debug!(attempt, "capacity guard lost the race; retrying");
                }
                AllocateAttempt::RequestCollision => {
                    // A concurrent call for the same id won the insert; the
                    // next attempt's pre-check returns its reservation.
                    bump(&self.counters.alloc_retries);
                    debug!(attempt, "request_id collision; re-reading");
                }
            }
        }

        bump(&self.counters.alloc_overloaded);
        warn!(
            attempts = self.max_attempts,
            "retry budget exhausted under contention; reporting overload"
        );
        Err(AppError::Overloaded)
    }

    /// Removes the reservation held by `request_id` and returns its tokens
    /// to its node.
    #[instrument(skip(self), target = "alloc", fields(node_id = tracing::field::Empty))]
    pub async fn free(&self, request_id: &str) -> Result<Released, AppError> {
        if request_id.is_empty() {
            bump(&self.counters.alloc_invalid);
            return Err(AppError::Invalid("request_id must be non-empty".into()));
        }

        let freed = warn_if_slow("db_release", request_id, Duration::from_millis(250), async {
            self.repo.release(request_id).await
        })
        .await
        .with_context(|| format!("release failed for request {request_id}"))?;

        match freed {
            Some(f) => {
                bump(&self.counters.free_released);
                annotate_placement(f.node_id);
                info!(node_id = f.node_id, tokens = f.tokens, "reservation released");
                Ok(Released { node_id: f.node_id })
            }
            None => {
                bump(&self.counters.free_not_found);
                debug!("free for unknown request_id");
                Err(AppError::NotFound)
            }
        }
    }

    async fn ceiling(&self) -> Result<Option<i64>, AppError> {
        let v = self
            .ceiling
            .get_or_try_init(|| async {
                self.repo
                    .max_capacity()
                    .await
                    .context("failed to read node capacity ceiling")
            })
            .await?;
        Ok(*v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::alloc::strategy::{PlacementOrder, Strategy};
    use crate::node::model::Node;
    use crate::node::repository::Freed;

    /// Scripted repository: each try_allocate pops the next outcome.
    struct MockRepo {
        script: Mutex<VecDeque<AllocateAttempt>>,
        calls: AtomicU32,
        seen_orders: Mutex<Vec<PlacementOrder>>,
        release_result: Option<Freed>,
        max_capacity: Option<i64>,
    }

    impl MockRepo {
        fn scripted(outcomes: Vec<AllocateAttempt>) -> Self {
            Self {
                script: Mutex::new(outcomes.into()),
                calls: AtomicU32::new(0),
                seen_orders: Mutex::new(vec![]),
                release_result: None,
                max_capacity: Some(300),
            }
        }
    }

    #[async_trait::async_trait]
    impl NodeRepository for MockRepo {
        async fn try_allocate(
            &self,
            _request_id: &str,
            _tokens: i64,
            order: PlacementOrder,
        ) -> anyhow::Result<AllocateAttempt> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_orders.lock().push(order);
            Ok(self
                .script
                .lock()
                .pop_front()
                .unwrap_or(AllocateAttempt::NoCandidate))
        }

        async fn release(&self, _request_id: &str) -> anyhow::Result<Option<Freed>> {
            Ok(self.release_result.clone())
        }

        async fn snapshot_nodes(&self) -> anyhow::Result<Vec<Node>> {
            Ok(vec![])
        }

        async fn count_reservations(&self) -> anyhow::Result<i64> {
            Ok(0)
        }

        async fn max_capacity(&self) -> anyhow::Result<Option<i64>> {
            Ok(self.max_capacity)
        }

        async fn ensure_nodes(&self, _count: i64, _budget: i64) -> anyhow::Result<u64> {
            Ok(0)
        }

        async fn ping(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn engine(repo: Arc<MockRepo>, strategy: Strategy) -> Allocator {
        Allocator::new(
            repo,
            Arc::new(StrategyCell::new(strategy)),
            0.5,
            300,
            8,
            Counters::default(),
        )
    }

    #[tokio::test]
    async fn placed_on_first_attempt() {
        let repo = Arc::new(MockRepo::scripted(vec![AllocateAttempt::Placed {
            node_id: 1,
            remaining: 200,
        }]));
        let alloc = engine(repo.clone(), Strategy::Best);

        let lease = alloc.allocate("r1", 100).await.unwrap();
        assert_eq!(lease, Lease { node_id: 1, remaining: 200 });
        assert_eq!(repo.calls.load(Ordering::SeqCst), 1);
        assert_eq!(alloc.counters.snapshot().alloc_granted, 1);
    }

    #[tokio::test]
    async fn existing_reservation_short_circuits() {
        let repo = Arc::new(MockRepo::scripted(vec![AllocateAttempt::Existing {
            node_id: 2,
            remaining: 50,
        }]));
        let alloc = engine(repo, Strategy::Best);

        let lease = alloc.allocate("r1", 100).await.unwrap();
        assert_eq!(lease.node_id, 2);
        assert_eq!(alloc.counters.snapshot().alloc_idempotent, 1);
    }

    #[tokio::test]
    async fn cas_miss_retries_until_placed() {
        let repo = Arc::new(MockRepo::scripted(vec![
            AllocateAttempt::CasMiss,
            AllocateAttempt::CasMiss,
            AllocateAttempt::Placed { node_id: 1, remaining: 0 },
        ]));
        let alloc = engine(repo.clone(), Strategy::Best);

        let lease = alloc.allocate("r1", 100).await.unwrap();
        assert_eq!(lease.node_id, 1);
        assert_eq!(repo.calls.load(Ordering::SeqCst), 3);
        assert_eq!(alloc.counters.snapshot().alloc_retries, 2);
    }

    #[tokio::test]
    async fn request_collision_resolves_to_winner() {
        let repo = Arc::new(MockRepo::scripted(vec![
            AllocateAttempt::RequestCollision,
            AllocateAttempt::Existing { node_id: 1, remaining: 150 },
        ]));
        let alloc = engine(repo.clone(), Strategy::Best);

        let lease = alloc.allocate("r1", 100).await.unwrap();
        assert_eq!(lease, Lease { node_id: 1, remaining: 150 });
        assert_eq!(repo.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn no_candidate_is_overload_without_retry() {
        let repo = Arc::new(MockRepo::scripted(vec![AllocateAttempt::NoCandidate]));
        let alloc = engine(repo.clone(), Strategy::Best);

        let err = alloc.allocate("r1", 100).await.unwrap_err();
        assert!(matches!(err, AppError::Overloaded));
        assert_eq!(repo.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn retry_budget_exhaustion_is_overload() {
        let repo = Arc::new(MockRepo::scripted(vec![AllocateAttempt::CasMiss; 20]));
        let alloc = engine(repo.clone(), Strategy::Best);

        let err = alloc.allocate("r1", 100).await.unwrap_err();
        assert!(matches!(err, AppError::Overloaded));
        assert_eq!(repo.calls.load(Ordering::SeqCst), 8);
        assert!(logs_contain("retry budget exhausted"));
    }

    #[tokio::test]
    async fn validation_rejects_without_touching_store() {
        let repo = Arc::new(MockRepo::scripted(vec![]));
        let alloc = engine(repo.clone(), Strategy::Best);

        assert!(matches!(
            alloc.allocate("", 100).await.unwrap_err(),
            AppError::Invalid(_)
        ));
        assert!(matches!(
            alloc.allocate("r1", 0).await.unwrap_err(),
            AppError::Invalid(_)
        ));
        assert!(matches!(
            alloc.allocate("r1", -5).await.unwrap_err(),
            AppError::Invalid(_)
        ));
        // Above the pool's largest capacity (mock reports 300).
        assert!(matches!(
            alloc.allocate("r1", 301).await.unwrap_err(),
            AppError::Invalid(_)
        ));

        assert_eq!(repo.calls.load(Ordering::SeqCst), 0);
        assert_eq!(alloc.counters.snapshot().alloc_invalid, 4);
    }

    #[tokio::test]
    async fn large_request_forces_descending_order_under_best_fit() {
        let repo = Arc::new(MockRepo::scripted(vec![
            AllocateAttempt::Placed { node_id: 2, remaining: 150 },
            AllocateAttempt::Placed { node_id: 1, remaining: 200 },
        ]));
        let alloc = engine(repo.clone(), Strategy::Best);

        // 150 >= 0.5 * 300 -> large, 100 is not.
        alloc.allocate("big", 150).await.unwrap();
        alloc.allocate("small", 100).await.unwrap();

        let orders = repo.seen_orders.lock().clone();
        assert_eq!(
            orders,
            vec![PlacementOrder::RemainingDesc, PlacementOrder::RemainingAsc]
        );
    }

    #[tokio::test]
    async fn free_releases_and_reports_not_found() {
        let mut repo = MockRepo::scripted(vec![]);
        repo.release_result = Some(Freed { node_id: 1, tokens: 100 });
        let repo = Arc::new(repo);
        let alloc = engine(repo, Strategy::Best);

        let released = alloc.free("r1").await.unwrap();
        assert_eq!(released, Released { node_id: 1 });

        let repo = Arc::new(MockRepo::scripted(vec![]));
        let alloc = engine(repo, Strategy::Best);
        assert!(matches!(alloc.free("gone").await.unwrap_err(), AppError::NotFound));
        assert!(matches!(alloc.free("").await.unwrap_err(), AppError::Invalid(_)));
    }
}
