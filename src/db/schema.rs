use sqlx::AnyPool;

pub async fn migrate(pool: &AnyPool) -> anyhow::Result<()> {
    // Nodes: fixed capacity, moving `used`. The CHECK mirrors the runtime
    // guard; it must never fire if the conditional update is doing its job.
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS nodes (
  id BIGINT PRIMARY KEY,
  capacity BIGINT NOT NULL,
  used BIGINT NOT NULL DEFAULT 0,
  CHECK (used >= 0 AND used <= capacity)
);
"#,
    )
    .execute(pool)
    .await?;

    // Reservations: request_id is the idempotency key; a conflicting insert
    // means another call already holds the reservation.
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS reservations (
  request_id TEXT PRIMARY KEY,
  node_id BIGINT NOT NULL REFERENCES nodes(id),
  tokens BIGINT NOT NULL CHECK (tokens > 0),
  created_at BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(r#"CREATE INDEX IF NOT EXISTS idx_reservations_node ON reservations(node_id);"#)
        .execute(pool)
        .await?;

    Ok(())
}
