use anyhow::{Context, Result};
use tracing::{info, instrument};

use crate::node::repository::NodeRepository;

/// Ensures node rows `1..=nodes` exist with `capacity = budget, used = 0`.
///
/// Rows already present are left alone, so running this on every startup is
/// safe and never disturbs live `used` accounting.
#[instrument(skip(repo), target = "seed")]
pub async fn run(repo: &dyn NodeRepository, nodes: i64, budget: i64) -> Result<()> {
    let inserted = repo
        .ensure_nodes(nodes, budget)
        .await
        .context("node seeding failed")?;

    info!(nodes, budget, inserted, "node seed complete");
    Ok(())
}
