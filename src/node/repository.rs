use anyhow::Result;
use async_trait::async_trait;

use crate::alloc::strategy::PlacementOrder;
use crate::node::model::Node;

/// Outcome of a single allocation attempt against the store.
///
/// Only `Placed` changes state. `CasMiss` and `RequestCollision` are the two
/// expected races; the engine retries them instead of surfacing an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AllocateAttempt {
    /// A fresh reservation was committed on `node_id`.
    Placed { node_id: i64, remaining: i64 },
    /// The request_id already holds a reservation; nothing was written.
    Existing { node_id: i64, remaining: i64 },
    /// No node currently satisfies `remaining >= tokens`.
    NoCandidate,
    /// The candidate's guard re-check failed (another writer got there first).
    CasMiss,
    /// A concurrent call for the same request_id won the reservation insert.
    RequestCollision,
}

/// A released reservation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Freed {
    pub node_id: i64,
    pub tokens: i64,
}

/// Transactional persistence gateway over the nodes and reservations tables.
///
/// Every method is a whole transaction: callers never hold store locks
/// across calls, and a returned value implies the transaction committed.
#[async_trait]
pub trait NodeRepository: Send + Sync {
    /// One pass of the allocation protocol: idempotency pre-check, ordered
    /// candidate select, guarded capacity update, reservation insert.
    async fn try_allocate(
        &self,
        request_id: &str,
        tokens: i64,
        order: PlacementOrder,
    ) -> Result<AllocateAttempt>;

    /// Removes the reservation for `request_id` and returns its tokens to
    /// its node. `None` when no such reservation exists.
    async fn release(&self, request_id: &str) -> Result<Option<Freed>>;

    async fn snapshot_nodes(&self) -> Result<Vec<Node>>;

    async fn count_reservations(&self) -> Result<i64>;

    /// Largest capacity across all nodes; `None` when the pool is unseeded.
    /// Capacity is immutable after seeding, so the value is cacheable.
    async fn max_capacity(&self) -> Result<Option<i64>>;

    /// Inserts node rows `1..=count` where absent, with `used = 0`.
    /// Existing rows are never touched. Returns the number inserted.
    async fn ensure_nodes(&self, count: i64, budget: i64) -> Result<u64>;

    /// Cheap liveness probe for the health endpoint.
    async fn ping(&self) -> Result<()>;
}
