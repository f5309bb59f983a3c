use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{AnyPool, Row};

use crate::alloc::strategy::PlacementOrder;
use crate::db::Dialect;
use crate::node::model::Node;
use crate::node::repository::{AllocateAttempt, Freed, NodeRepository};
use crate::time::now_ms;

/// SQLx-backed implementation of NodeRepository.
/// Responsible only for persistence and row mapping; placement policy is the
/// engine's job and arrives here as a ready-made ordering.
pub struct SqlxNodeRepository {
    pool: Arc<AnyPool>,
    dialect: Dialect,
}

impl SqlxNodeRepository {
    pub fn new(pool: Arc<AnyPool>, dialect: Dialect) -> Self {
        Self { pool, dialect }
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Candidate select for one allocation attempt.
    ///
    /// Postgres locks the winning row and skips rows other transactions
    /// already hold, routing concurrent workers to different nodes instead
    /// of convoying on one. Sqlite has no row locks; the conditional update
    /// is the only guard there.
    fn candidate_sql(&self, order: PlacementOrder) -> String {
        let dir = match order {
            PlacementOrder::RemainingAsc => "ASC",
            PlacementOrder::RemainingDesc => "DESC",
        };
        match self.dialect {
            Dialect::Postgres => format!(
                "SELECT id FROM nodes \
                 WHERE capacity - used >= $1 \
                 ORDER BY (capacity - used) {dir}, id ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED"
            ),
            Dialect::Sqlite => format!(
                "SELECT id FROM nodes \
                 WHERE capacity - used >= ? \
                 ORDER BY (capacity - used) {dir}, id ASC \
                 LIMIT 1"
            ),
        }
    }
}

#[async_trait]
impl NodeRepository for SqlxNodeRepository {
    async fn try_allocate(
        &self,
        request_id: &str,
        tokens: i64,
        order: PlacementOrder,
    ) -> Result<AllocateAttempt> {
        let mut tx = self.pool.begin().await.context("begin allocation tx")?;

        // Idempotency pre-check: a repeated request_id returns the original
        // reservation with the node's current remaining.
        let precheck = match self.dialect {
            Dialect::Postgres => {
                "SELECT r.node_id AS node_id, n.capacity AS capacity, n.used AS used \
                 FROM reservations r JOIN nodes n ON n.id = r.node_id \
                 WHERE r.request_id = $1"
            }
            Dialect::Sqlite => {
                "SELECT r.node_id AS node_id, n.capacity AS capacity, n.used AS used \
                 FROM reservations r JOIN nodes n ON n.id = r.node_id \
                 WHERE r.request_id = ?"
            }
        };
        if let Some(row) = sqlx::query(precheck)
            .bind(request_id)
            .fetch_optional(&mut *tx)
            .await?
        {
            let node_id: i64 = row.get("node_id");
            let capacity: i64 = row.get("capacity");
            let used: i64 = row.get("used");
            tx.commit().await?;
            return Ok(AllocateAttempt::Existing {
                node_id,
                remaining: capacity - used,
            });
        }

        let candidate = sqlx::query(&self.candidate_sql(order))
            .bind(tokens)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = candidate else {
            tx.commit().await?;
            return Ok(AllocateAttempt::NoCandidate);
        };
        let node_id: i64 = row.get("id");

        // Oversubscription guard. Re-evaluated on the current row version,
        // so a stale candidate snapshot shows up as zero rows affected.
        let updated = match self.dialect {
            Dialect::Postgres => {
                sqlx::query(
                    "UPDATE nodes SET used = used + $1 \
                     WHERE id = $2 AND capacity - used >= $1",
                )
                .bind(tokens)
                .bind(node_id)
            }
            Dialect::Sqlite => {
                sqlx::query(
                    "UPDATE nodes SET used = used + ? \
                     WHERE id = ? AND capacity - used >= ?",
                )
                .bind(tokens)
                .bind(node_id)
                .bind(tokens)
            }
        }
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(AllocateAttempt::CasMiss);
        }

        // Conflict on request_id means a concurrent call for the same id
        // won; unwind the capacity bump and let the caller re-read.
        let insert = match self.dialect {
            Dialect::Postgres => {
                "INSERT INTO reservations (request_id, node_id, tokens, created_at) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT (request_id) DO NOTHING"
            }
            Dialect::Sqlite => {
                "INSERT INTO reservations (request_id, node_id, tokens, created_at) \
                 VALUES (?, ?, ?, ?) \
                 ON CONFLICT (request_id) DO NOTHING"
            }
        };
        let inserted = sqlx::query(insert)
            .bind(request_id)
            .bind(node_id)
            .bind(tokens)
            .bind(now_ms())
            .execute(&mut *tx)
            .await?;
        if inserted.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(AllocateAttempt::RequestCollision);
        }

        // Remaining is reported post-update, read inside the transaction.
        let state = match self.dialect {
            Dialect::Postgres => "SELECT capacity, used FROM nodes WHERE id = $1",
            Dialect::Sqlite => "SELECT capacity, used FROM nodes WHERE id = ?",
        };
        let row = sqlx::query(state)
            .bind(node_id)
            .fetch_one(&mut *tx)
            .await?;
        let capacity: i64 = row.get("capacity");
        let used: i64 = row.get("used");

        tx.commit().await.context("commit allocation tx")?;
        Ok(AllocateAttempt::Placed {
            node_id,
            remaining: capacity - used,
        })
    }

    async fn release(&self, request_id: &str) -> Result<Option<Freed>> {
        let mut tx = self.pool.begin().await.context("begin release tx")?;

        let lookup = match self.dialect {
            Dialect::Postgres => {
                "SELECT node_id, tokens FROM reservations WHERE request_id = $1 FOR UPDATE"
            }
            Dialect::Sqlite => "SELECT node_id, tokens FROM reservations WHERE request_id = ?",
        };
        let Some(row) = sqlx::query(lookup)
            .bind(request_id)
            .fetch_optional(&mut *tx)
            .await?
        else {
            tx.commit().await?;
            return Ok(None);
        };
        let node_id: i64 = row.get("node_id");
        let tokens: i64 = row.get("tokens");

        if self.dialect == Dialect::Postgres {
            // Serialise against allocators touching the same node.
            sqlx::query("SELECT id FROM nodes WHERE id = $1 FOR UPDATE")
                .bind(node_id)
                .fetch_optional(&mut *tx)
                .await?;
        }

        // used = sum of reservation tokens keeps this from going negative;
        // the floor is defensive against a violated ledger, not a code path.
        let update = match self.dialect {
            Dialect::Postgres => {
                "UPDATE nodes SET used = GREATEST(used - $1, 0) WHERE id = $2"
            }
            Dialect::Sqlite => "UPDATE nodes SET used = MAX(used - ?, 0) WHERE id = ?",
        };
        sqlx::query(update)
            .bind(tokens)
            .bind(node_id)
            .execute(&mut *tx)
            .await?;

        let delete = match self.dialect {
            Dialect::Postgres => "DELETE FROM reservations WHERE request_id = $1",
            Dialect::Sqlite => "DELETE FROM reservations WHERE request_id = ?",
        };
        sqlx::query(delete)
            .bind(request_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await.context("commit release tx")?;
        Ok(Some(Freed { node_id, tokens }))
    }

    async fn snapshot_nodes(&self) -> Result<Vec<Node>> {
        let rows = sqlx::query("SELECT id, capacity, used FROM nodes ORDER BY id ASC")
            .fetch_all(&*self.pool)
            .await?;

        Ok(rows
            .iter()
            .map(|r| Node {
                id: r.get("id"),
                capacity: r.get("capacity"),
                used: r.get("used"),
            })
            .collect())
    }

    async fn count_reservations(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM reservations")
            .fetch_one(&*self.pool)
            .await?;
        Ok(row.get("n"))
    }

    async fn max_capacity(&self) -> Result<Option<i64>> {
        let row = sqlx::query("SELECT MAX(capacity) AS max_capacity FROM nodes")
            .fetch_one(&*self.pool)
            .await?;
        Ok(row.get::<Option<i64>, _>("max_capacity"))
    }

    async fn ensure_nodes(&self, count: i64, budget: i64) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("begin seed tx")?;

        let insert = match self.dialect {
            Dialect::Postgres => {
                "INSERT INTO nodes (id, capacity, used) VALUES ($1, $2, 0) \
                 ON CONFLICT (id) DO NOTHING"
            }
            Dialect::Sqlite => {
                "INSERT INTO nodes (id, capacity, used) VALUES (?, ?, 0) \
                 ON CONFLICT (id) DO NOTHING"
            }
        };

        let mut inserted = 0u64;
        for id in 1..=count {
            let res = sqlx::query(insert)
                .bind(id)
                .bind(budget)
                .execute(&mut *tx)
                .await?;
            inserted += res.rows_affected();
        }

        tx.commit().await.context("commit seed tx")?;
        Ok(inserted)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&*self.pool).await?;
        Ok(())
    }
}
