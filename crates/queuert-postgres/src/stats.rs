//! Queue statistics (`SPEC_FULL.md` §C), grounded on
//! `seesaw-job-postgres::PgJobStore::stats`/`QueueStats`. Not named in `spec.md`
//! but a natural adjunct to any job-queue adapter.

use queuert_core::QueuertError;
use sqlx::{PgPool, Row};

/// Per-status job counts across the whole table.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub blocked: i64,
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
}

pub async fn fetch_stats(pool: &PgPool) -> queuert_core::Result<QueueStats> {
    let row = sqlx::query(
        r#"
        SELECT
            COUNT(*) FILTER (WHERE status = 'blocked')   AS blocked,
            COUNT(*) FILTER (WHERE status = 'pending')   AS pending,
            COUNT(*) FILTER (WHERE status = 'running')   AS running,
            COUNT(*) FILTER (WHERE status = 'completed') AS completed
        FROM job
        "#,
    )
    .fetch_one(pool)
    .await
    .map_err(QueuertError::storage)?;

    Ok(QueueStats {
        blocked: row.get("blocked"),
        pending: row.get("pending"),
        running: row.get("running"),
        completed: row.get("completed"),
    })
}
