use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::instrument;

use crate::alloc::strategy::{Strategy, StrategyCell};
use crate::metrics::counters::{CounterSnapshot, Counters};
use crate::node::repository::NodeRepository;

/// Read-only aggregation over nodes and reservations.
pub struct MetricsService {
    repo: Arc<dyn NodeRepository>,
    strategy: Arc<StrategyCell>,
    counters: Counters,
}

#[derive(Clone, Debug, Serialize)]
pub struct NodeView {
    pub id: i64,
    pub capacity: i64,
    pub used: i64,
    pub remaining: i64,
}

#[derive(Clone, Debug, Serialize, Default)]
pub struct Totals {
    pub capacity: i64,
    pub used: i64,
    pub remaining: i64,
}

/// The metrics endpoint's response body. Built from two store reads, so it
/// is a consistent-enough view, not linearisable with in-flight allocations.
#[derive(Clone, Debug, Serialize)]
pub struct MetricsSnapshot {
    pub nodes: Vec<NodeView>,
    pub totals: Totals,
    pub active_reservations: i64,
    pub strategy: Strategy,
    pub counters: CounterSnapshot,
}

impl MetricsService {
    pub fn new(repo: Arc<dyn NodeRepository>, strategy: Arc<StrategyCell>, counters: Counters) -> Self {
        Self {
            repo,
            strategy,
            counters,
        }
    }

    #[instrument(skip(self), target = "metrics")]
    pub async fn snapshot(&self) -> Result<MetricsSnapshot> {
        let nodes = self
            .repo
            .snapshot_nodes()
            .await
            .context("failed to read nodes for metrics")?;
        let active_reservations = self
            .repo
            .count_reservations()
            .await
            .context("failed to count reservations for metrics")?;

        let mut totals = Totals::default();
        let views: Vec<NodeView> = nodes
            .iter()
            .map(|n| {
                totals.capacity += n.capacity;
                totals.used += n.used;
                totals.remaining += n.remaining();
                NodeView {
                    id: n.id,
                    capacity: n.capacity,
                    used: n.used,
                    remaining: n.remaining(),
                }
            })
            .collect();

        Ok(MetricsSnapshot {
            nodes: views,
            totals,
            active_reservations,
            strategy: self.strategy.get(),
            counters: self.counters.snapshot(),
        })
    }
}
