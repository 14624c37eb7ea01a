//! PostgreSQL implementation of the Queuert `StateAdapter`/`NotifyAdapter`
//! contracts (`spec.md` §4.1, §4.2).
//!
//! # Database schema
//!
//! See `migrations/0001_init.sql` for the full DDL: a `job` table (§3's Job fields),
//! a `job_blocker` join table, and the indexes the contract requires (acquisition,
//! last-of-chain, dedup, expired-lease) plus the `(chain_id, origin_id)` uniqueness
//! constraint that backs continuation deduplication.
//!
//! # Usage
//!
//! ```rust,ignore
//! use queuert_postgres::PgStateAdapter;
//! use sqlx::PgPool;
//!
//! let pool = PgPool::connect("postgres://localhost/queuert").await?;
//! let state = PgStateAdapter::new(pool.clone());
//! state.migrate().await?;
//! ```

mod notify;
mod retry;
mod stats;

pub use notify::PgNotifyAdapter;
pub use stats::{fetch_stats, QueueStats};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queuert_core::{
    AcquiredJob, BlockerOutcome, ChainId, CreatedJob, Deduplication, DeduplicationScope, Job,
    JobChain, JobId, JobStatus, NewJob, QueuertError, Result, RetryConfig, Schedule, StateAdapter,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};

use retry::with_retry;

/// Columns selected for every `Job` row. `status` is cast to `TEXT` so the crate
/// never needs a `sqlx::Type` impl for `queuert_core::JobStatus`; the two crates
/// stay decoupled the way the core/adapter split in `SPEC_FULL.md` §A intends.
const JOB_COLUMNS: &str = "id, type_name, chain_id, chain_type_name, root_chain_id, origin_id, \
     input, output, status::text AS status, created_at, scheduled_at, completed_at, \
     completed_by, attempt, last_attempt_at, last_attempt_error, leased_by, leased_until, \
     deduplication_key";

fn status_from_sql(raw: &str) -> queuert_core::Result<JobStatus> {
    match raw {
        "blocked" => Ok(JobStatus::Blocked),
        "pending" => Ok(JobStatus::Pending),
        "running" => Ok(JobStatus::Running),
        "completed" => Ok(JobStatus::Completed),
        other => Err(QueuertError::storage(anyhow::anyhow!(
            "unrecognized job_status `{other}` read from storage"
        ))),
    }
}

fn row_to_job(row: &PgRow) -> queuert_core::Result<Job> {
    let status: String = row.try_get("status").map_err(QueuertError::storage)?;
    Ok(Job {
        id: row.try_get("id").map_err(QueuertError::storage)?,
        type_name: row.try_get("type_name").map_err(QueuertError::storage)?,
        chain_id: row.try_get("chain_id").map_err(QueuertError::storage)?,
        chain_type_name: row
            .try_get("chain_type_name")
            .map_err(QueuertError::storage)?,
        root_chain_id: row
            .try_get("root_chain_id")
            .map_err(QueuertError::storage)?,
        origin_id: row.try_get("origin_id").map_err(QueuertError::storage)?,
        input: row.try_get("input").map_err(QueuertError::storage)?,
        output: row.try_get("output").map_err(QueuertError::storage)?,
        status: status_from_sql(&status)?,
        created_at: row.try_get("created_at").map_err(QueuertError::storage)?,
        scheduled_at: row
            .try_get("scheduled_at")
            .map_err(QueuertError::storage)?,
        completed_at: row
            .try_get("completed_at")
            .map_err(QueuertError::storage)?,
        completed_by: row
            .try_get("completed_by")
            .map_err(QueuertError::storage)?,
        attempt: row.try_get("attempt").map_err(QueuertError::storage)?,
        last_attempt_at: row
            .try_get("last_attempt_at")
            .map_err(QueuertError::storage)?,
        last_attempt_error: row
            .try_get("last_attempt_error")
            .map_err(QueuertError::storage)?,
        leased_by: row.try_get("leased_by").map_err(QueuertError::storage)?,
        leased_until: row
            .try_get("leased_until")
            .map_err(QueuertError::storage)?,
        deduplication_key: row
            .try_get("deduplication_key")
            .map_err(QueuertError::storage)?,
    })
}

/// A held transaction. Application code using `start_job_chain`/`complete_job_chain`
/// receives this same handle, so its own writes commit atomically with the job row
/// mutation (`spec.md` §4.1).
pub struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PgTransaction {
    /// Escape hatch for callers that need to run their own business-write SQL in
    /// the same transaction as the job mutation (`spec.md` §1: "atomically enqueue
    /// work alongside its own business writes").
    pub fn connection(&mut self) -> &mut sqlx::PgConnection {
        &mut self.tx
    }
}

/// A `sqlx::PgPool`-backed [`StateAdapter`], grounded on
/// `seesaw-job-postgres::PgJobStore` (pool ownership, `FOR UPDATE SKIP LOCKED`
/// acquisition) and `cyclotron-core::base_ops` (re-check-then-write mutation style).
#[derive(Clone)]
pub struct PgStateAdapter {
    pool: PgPool,
    retry: RetryConfig,
}

impl PgStateAdapter {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded migrations (the `Migration` auxiliary entity of `spec.md`
    /// §3, tracked via `sqlx`'s own `_sqlx_migrations` table).
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn stats(&self) -> queuert_core::Result<QueueStats> {
        fetch_stats(&self.pool).await
    }
}

async fn fetch_optional_job(
    conn: &mut sqlx::PgConnection,
    query: &str,
    id: JobId,
) -> queuert_core::Result<Option<Job>> {
    let row = sqlx::query(query)
        .bind(id)
        .fetch_optional(conn)
        .await
        .map_err(QueuertError::storage)?;
    row.as_ref().map(row_to_job).transpose()
}

/// Same as [`fetch_optional_job`] but for `FOR UPDATE` reads, which take a row lock
/// and so can fail with a transient deadlock/lock-timeout that's worth retrying.
async fn fetch_optional_job_for_update(
    retry: &RetryConfig,
    conn: &mut sqlx::PgConnection,
    query: &str,
    id: JobId,
) -> queuert_core::Result<Option<Job>> {
    let row = retry_in_tx!(retry, conn, sqlx::query(query).bind(id).fetch_optional(&mut *conn))
        .map_err(QueuertError::storage)?;
    row.as_ref().map(row_to_job).transpose()
}

fn resolve_schedule(schedule: Schedule, now: DateTime<Utc>) -> DateTime<Utc> {
    schedule.resolve(now)
}

#[async_trait]
impl StateAdapter for PgStateAdapter {
    type Transaction = PgTransaction;

    async fn begin(&self) -> Result<Self::Transaction> {
        let tx = with_retry(&self.retry, || self.pool.begin())
            .await
            .map_err(QueuertError::storage)?;
        Ok(PgTransaction { tx })
    }

    // Not wrapped in retry: by the time COMMIT itself fails, the underlying
    // transaction is already gone, so there's nothing left here to retry against.
    // A transient failure at commit can only be recovered by redoing every
    // statement from `begin()` onward, which is the caller's job, not this
    // method's. `retry_in_tx!` on the individual mutating statements below is
    // where `40001`/`40P01`/`55P03` actually get a chance to retry in place.
    async fn commit(&self, tx: Self::Transaction) -> Result<()> {
        tx.tx.commit().await.map_err(QueuertError::storage)
    }

    async fn rollback(&self, tx: Self::Transaction) -> Result<()> {
        tx.tx.rollback().await.map_err(QueuertError::storage)
    }

    async fn create_job(&self, tx: &mut Self::Transaction, new_job: NewJob) -> Result<CreatedJob> {
        let conn = tx.connection();
        let now = Utc::now();
        let is_chain_starter = new_job.id == new_job.chain_id;

        // Continuation dedup (structural, always active): spec.md §4.5 rule 1. The
        // partial unique index on (chain_id, origin_id) makes this race-safe even
        // across concurrent transactions.
        if let Some(origin_id) = new_job.origin_id {
            let insert_sql = format!(
                "INSERT INTO job (id, type_name, chain_id, chain_type_name, root_chain_id, \
                 origin_id, input, status, created_at, scheduled_at, attempt) \
                 VALUES ($1,$2,$3,$4,$5,$6,$7,'pending'::job_status,$8,$9,0) \
                 ON CONFLICT (chain_id, origin_id) WHERE origin_id IS NOT NULL DO NOTHING \
                 RETURNING {JOB_COLUMNS}"
            );
            let scheduled_at = resolve_schedule(new_job.schedule, now);
            let inserted = retry_in_tx!(
                &self.retry,
                conn,
                sqlx::query(&insert_sql)
                    .bind(new_job.id)
                    .bind(&new_job.type_name)
                    .bind(new_job.chain_id)
                    .bind(&new_job.chain_type_name)
                    .bind(new_job.root_chain_id)
                    .bind(origin_id)
                    .bind(&new_job.input)
                    .bind(now)
                    .bind(scheduled_at)
                    .fetch_optional(&mut *conn)
            )
            .map_err(QueuertError::storage)?;

            if let Some(row) = inserted {
                return Ok(CreatedJob {
                    job: row_to_job(&row)?,
                    deduplicated: false,
                });
            }

            let existing_sql = format!(
                "SELECT {JOB_COLUMNS} FROM job WHERE chain_id = $1 AND origin_id = $2"
            );
            let row = sqlx::query(&existing_sql)
                .bind(new_job.chain_id)
                .bind(origin_id)
                .fetch_one(&mut *conn)
                .await
                .map_err(QueuertError::storage)?;
            return Ok(CreatedJob {
                job: row_to_job(&row)?,
                deduplicated: true,
            });
        }

        // Key dedup (opt-in, chain-starters only): spec.md §4.5 rule 2.
        if is_chain_starter {
            if let Some(dedup) = &new_job.deduplication {
                if let Some(existing) =
                    find_key_dedup_candidate(&mut *conn, &new_job.chain_type_name, dedup, now)
                        .await?
                {
                    return Ok(CreatedJob {
                        job: existing,
                        deduplicated: true,
                    });
                }
            }
        }

        let dedup_key = if is_chain_starter {
            new_job.deduplication.as_ref().map(|d| d.key.clone())
        } else {
            None
        };
        let scheduled_at = resolve_schedule(new_job.schedule, now);
        let insert_sql = format!(
            "INSERT INTO job (id, type_name, chain_id, chain_type_name, root_chain_id, \
             origin_id, input, status, created_at, scheduled_at, attempt, deduplication_key) \
             VALUES ($1,$2,$3,$4,$5,NULL,$6,'pending'::job_status,$7,$8,0,$9) \
             RETURNING {JOB_COLUMNS}"
        );
        let row = retry_in_tx!(
            &self.retry,
            conn,
            sqlx::query(&insert_sql)
                .bind(new_job.id)
                .bind(&new_job.type_name)
                .bind(new_job.chain_id)
                .bind(&new_job.chain_type_name)
                .bind(new_job.root_chain_id)
                .bind(&new_job.input)
                .bind(now)
                .bind(scheduled_at)
                .bind(&dedup_key)
                .fetch_one(&mut *conn)
        )
        .map_err(QueuertError::storage)?;

        Ok(CreatedJob {
            job: row_to_job(&row)?,
            deduplicated: false,
        })
    }

    async fn get_job_by_id(&self, tx: &mut Self::Transaction, id: JobId) -> Result<Option<Job>> {
        let query = format!("SELECT {JOB_COLUMNS} FROM job WHERE id = $1");
        fetch_optional_job(tx.connection(), &query, id).await
    }

    async fn get_job_for_update(
        &self,
        tx: &mut Self::Transaction,
        id: JobId,
    ) -> Result<Option<Job>> {
        let query = format!("SELECT {JOB_COLUMNS} FROM job WHERE id = $1 FOR UPDATE");
        fetch_optional_job_for_update(&self.retry, tx.connection(), &query, id).await
    }

    async fn get_current_job_for_update(
        &self,
        tx: &mut Self::Transaction,
        chain_id: ChainId,
    ) -> Result<Option<Job>> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM job WHERE chain_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT 1 FOR UPDATE"
        );
        fetch_optional_job_for_update(&self.retry, tx.connection(), &query, chain_id).await
    }

    async fn get_job_chain_by_id(
        &self,
        tx: &mut Self::Transaction,
        job_id: JobId,
    ) -> Result<Option<JobChain>> {
        let conn = tx.connection();
        let chain_id: Option<ChainId> = sqlx::query_scalar("SELECT chain_id FROM job WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(QueuertError::storage)?;
        let Some(chain_id) = chain_id else {
            return Ok(None);
        };

        let root_query = format!("SELECT {JOB_COLUMNS} FROM job WHERE id = $1");
        let root_row = sqlx::query(&root_query)
            .bind(chain_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(QueuertError::storage)?;
        let last_query = format!(
            "SELECT {JOB_COLUMNS} FROM job WHERE chain_id = $1 ORDER BY created_at DESC, id DESC LIMIT 1"
        );
        let last_row = sqlx::query(&last_query)
            .bind(chain_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(QueuertError::storage)?;

        match (root_row, last_row) {
            (Some(root), Some(last)) => Ok(Some(JobChain {
                root: row_to_job(&root)?,
                last: row_to_job(&last)?,
            })),
            _ => Ok(None),
        }
    }

    async fn get_next_job_available_in_ms(
        &self,
        tx: &mut Self::Transaction,
        type_names: &[String],
    ) -> Result<Option<i64>> {
        if type_names.is_empty() {
            return Ok(None);
        }
        let conn = tx.connection();
        let ms: Option<f64> = sqlx::query_scalar(
            "SELECT EXTRACT(EPOCH FROM (MIN(scheduled_at) - NOW())) * 1000 \
             FROM job WHERE status = 'pending' AND type_name = ANY($1)",
        )
        .bind(type_names)
        .fetch_one(&mut *conn)
        .await
        .map_err(QueuertError::storage)?;

        Ok(ms.map(|v| (v.round() as i64).max(0)))
    }

    async fn acquire_job(
        &self,
        tx: &mut Self::Transaction,
        type_names: &[String],
    ) -> Result<Option<AcquiredJob>> {
        if type_names.is_empty() {
            return Ok(None);
        }
        let conn = tx.connection();
        let acquire_sql = format!(
            "WITH candidate AS ( \
                 SELECT id FROM job \
                 WHERE status = 'pending' AND scheduled_at <= NOW() AND type_name = ANY($1) \
                 ORDER BY scheduled_at ASC, id ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE job SET status = 'running'::job_status, attempt = attempt + 1 \
             FROM candidate WHERE job.id = candidate.id \
             RETURNING {JOB_COLUMNS}"
        );
        let row = retry_in_tx!(
            &self.retry,
            conn,
            sqlx::query(&acquire_sql)
                .bind(type_names)
                .fetch_optional(&mut *conn)
        )
        .map_err(QueuertError::storage)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let job = row_to_job(&row)?;

        let has_more: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM job WHERE status = 'pending' AND scheduled_at <= NOW() \
             AND type_name = ANY($1))",
        )
        .bind(type_names)
        .fetch_one(&mut *conn)
        .await
        .map_err(QueuertError::storage)?;

        Ok(Some(AcquiredJob { job, has_more }))
    }

    async fn renew_job_lease(
        &self,
        tx: &mut Self::Transaction,
        id: JobId,
        worker_id: &str,
        duration_ms: i64,
    ) -> Result<Job> {
        let conn = tx.connection();
        let leased_until = Utc::now() + chrono::Duration::milliseconds(duration_ms);
        let query = format!(
            "UPDATE job SET leased_by = $1, leased_until = $2, status = 'running'::job_status \
             WHERE id = $3 RETURNING {JOB_COLUMNS}"
        );
        let row = retry_in_tx!(
            &self.retry,
            conn,
            sqlx::query(&query)
                .bind(worker_id)
                .bind(leased_until)
                .bind(id)
                .fetch_optional(&mut *conn)
        )
        .map_err(QueuertError::storage)?
        .ok_or(QueuertError::JobNotFound(id))?;
        row_to_job(&row)
    }

    async fn remove_expired_job_lease(
        &self,
        tx: &mut Self::Transaction,
        type_names: &[String],
        ignored_ids: &[JobId],
    ) -> Result<Option<Job>> {
        if type_names.is_empty() {
            return Ok(None);
        }
        let conn = tx.connection();
        let query = format!(
            "WITH candidate AS ( \
                 SELECT id FROM job \
                 WHERE status = 'running' AND leased_until < NOW() \
                   AND type_name = ANY($1) AND NOT (id = ANY($2)) \
                 ORDER BY leased_until ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE job SET status = 'pending'::job_status, leased_by = NULL, leased_until = NULL \
             FROM candidate WHERE job.id = candidate.id \
             RETURNING {JOB_COLUMNS}"
        );
        let row = retry_in_tx!(
            &self.retry,
            conn,
            sqlx::query(&query)
                .bind(type_names)
                .bind(ignored_ids)
                .fetch_optional(&mut *conn)
        )
        .map_err(QueuertError::storage)?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn complete_job(
        &self,
        tx: &mut Self::Transaction,
        id: JobId,
        output: serde_json::Value,
        worker_id: Option<&str>,
    ) -> Result<Job> {
        let conn = tx.connection();
        let current_query = format!("SELECT {JOB_COLUMNS} FROM job WHERE id = $1 FOR UPDATE");
        let current = retry_in_tx!(
            &self.retry,
            conn,
            sqlx::query(&current_query).bind(id).fetch_optional(&mut *conn)
        )
        .map_err(QueuertError::storage)?
        .map(|row| row_to_job(&row))
        .transpose()?
        .ok_or(QueuertError::JobNotFound(id))?;

        if current.status == JobStatus::Completed {
            return Err(QueuertError::AlreadyCompleted(id));
        }
        if let Some(worker_id) = worker_id {
            if current.leased_by.as_deref() != Some(worker_id) {
                return Err(QueuertError::TakenByAnotherWorker(id));
            }
        }

        let query = format!(
            "UPDATE job SET status = 'completed'::job_status, completed_at = NOW(), \
             completed_by = $1, output = $2, leased_by = NULL, leased_until = NULL \
             WHERE id = $3 RETURNING {JOB_COLUMNS}"
        );
        let row = retry_in_tx!(
            &self.retry,
            conn,
            sqlx::query(&query)
                .bind(worker_id)
                .bind(&output)
                .bind(id)
                .fetch_one(&mut *conn)
        )
        .map_err(QueuertError::storage)?;
        row_to_job(&row)
    }

    async fn reschedule_job(
        &self,
        tx: &mut Self::Transaction,
        id: JobId,
        schedule: Schedule,
        error: &str,
    ) -> Result<Job> {
        let conn = tx.connection();
        let now = Utc::now();
        let scheduled_at = resolve_schedule(schedule, now);
        let query = format!(
            "UPDATE job SET scheduled_at = $1, last_attempt_at = $2, last_attempt_error = $3, \
             leased_by = NULL, leased_until = NULL, status = 'pending'::job_status \
             WHERE id = $4 RETURNING {JOB_COLUMNS}"
        );
        let row = retry_in_tx!(
            &self.retry,
            conn,
            sqlx::query(&query)
                .bind(scheduled_at)
                .bind(now)
                .bind(error)
                .bind(id)
                .fetch_optional(&mut *conn)
        )
        .map_err(QueuertError::storage)?
        .ok_or(QueuertError::JobNotFound(id))?;
        row_to_job(&row)
    }

    async fn add_job_blockers(
        &self,
        tx: &mut Self::Transaction,
        job_id: JobId,
        blocked_by_chain_ids: &[ChainId],
    ) -> Result<BlockerOutcome> {
        let conn = tx.connection();

        let start_index: i32 = sqlx::query_scalar(
            "SELECT COUNT(*)::INT FROM job_blocker WHERE job_id = $1",
        )
        .bind(job_id)
        .fetch_one(&mut *conn)
        .await
        .map_err(QueuertError::storage)?;

        for (offset, chain_id) in blocked_by_chain_ids.iter().enumerate() {
            retry_in_tx!(
                &self.retry,
                conn,
                sqlx::query(
                    "INSERT INTO job_blocker (job_id, blocked_by_chain_id, index) VALUES ($1, $2, $3)",
                )
                .bind(job_id)
                .bind(chain_id)
                .bind(start_index + offset as i32)
                .execute(&mut *conn)
            )
            .map_err(QueuertError::storage)?;
        }

        let mut incomplete = Vec::new();
        for chain_id in blocked_by_chain_ids {
            let last_status: Option<String> = sqlx::query_scalar(
                "SELECT status::text FROM job WHERE chain_id = $1 \
                 ORDER BY created_at DESC, id DESC LIMIT 1",
            )
            .bind(chain_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(QueuertError::storage)?;

            let is_complete = last_status.as_deref() == Some("completed");
            if !is_complete {
                incomplete.push(*chain_id);
            }
        }

        if !incomplete.is_empty() {
            retry_in_tx!(
                &self.retry,
                conn,
                sqlx::query("UPDATE job SET status = 'blocked'::job_status WHERE id = $1")
                    .bind(job_id)
                    .execute(&mut *conn)
            )
            .map_err(QueuertError::storage)?;
        }

        let job_query = format!("SELECT {JOB_COLUMNS} FROM job WHERE id = $1");
        let row = sqlx::query(&job_query)
            .bind(job_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(QueuertError::storage)?
            .ok_or(QueuertError::JobNotFound(job_id))?;

        Ok(BlockerOutcome {
            job: row_to_job(&row)?,
            incomplete_blocker_chain_ids: incomplete,
        })
    }

    async fn schedule_blocked_jobs(
        &self,
        tx: &mut Self::Transaction,
        blocked_by_chain_id: ChainId,
    ) -> Result<Vec<JobId>> {
        let conn = tx.connection();

        let candidate_ids: Vec<JobId> = sqlx::query_scalar(
            "SELECT job_id FROM job_blocker WHERE blocked_by_chain_id = $1",
        )
        .bind(blocked_by_chain_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(QueuertError::storage)?;

        let mut transitioned = Vec::new();
        for job_id in candidate_ids {
            let is_blocked: Option<String> =
                sqlx::query_scalar("SELECT status::text FROM job WHERE id = $1")
                    .bind(job_id)
                    .fetch_optional(&mut *conn)
                    .await
                    .map_err(QueuertError::storage)?;
            if is_blocked.as_deref() != Some("blocked") {
                continue;
            }

            let all_complete: bool = sqlx::query_scalar(
                "SELECT NOT EXISTS ( \
                     SELECT 1 FROM job_blocker jb \
                     WHERE jb.job_id = $1 \
                       AND ( \
                           SELECT status FROM job \
                           WHERE chain_id = jb.blocked_by_chain_id \
                           ORDER BY created_at DESC, id DESC LIMIT 1 \
                       ) <> 'completed'::job_status \
                 )",
            )
            .bind(job_id)
            .fetch_one(&mut *conn)
            .await
            .map_err(QueuertError::storage)?;

            if all_complete {
                retry_in_tx!(
                    &self.retry,
                    conn,
                    sqlx::query(
                        "UPDATE job SET status = 'pending'::job_status, scheduled_at = NOW() \
                         WHERE id = $1",
                    )
                    .bind(job_id)
                    .execute(&mut *conn)
                )
                .map_err(QueuertError::storage)?;
                transitioned.push(job_id);
            }
        }

        Ok(transitioned)
    }

    async fn get_job_blockers(
        &self,
        tx: &mut Self::Transaction,
        job_id: JobId,
    ) -> Result<Vec<JobChain>> {
        let conn = tx.connection();
        let blocker_chain_ids: Vec<ChainId> = sqlx::query_scalar(
            "SELECT blocked_by_chain_id FROM job_blocker WHERE job_id = $1 ORDER BY index ASC",
        )
        .bind(job_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(QueuertError::storage)?;

        let mut chains = Vec::with_capacity(blocker_chain_ids.len());
        for chain_id in blocker_chain_ids {
            let root_query = format!("SELECT {JOB_COLUMNS} FROM job WHERE id = $1");
            let root_row = sqlx::query(&root_query)
                .bind(chain_id)
                .fetch_optional(&mut *conn)
                .await
                .map_err(QueuertError::storage)?;
            let last_query = format!(
                "SELECT {JOB_COLUMNS} FROM job WHERE chain_id = $1 \
                 ORDER BY created_at DESC, id DESC LIMIT 1"
            );
            let last_row = sqlx::query(&last_query)
                .bind(chain_id)
                .fetch_optional(&mut *conn)
                .await
                .map_err(QueuertError::storage)?;
            if let (Some(root), Some(last)) = (root_row, last_row) {
                chains.push(JobChain {
                    root: row_to_job(&root)?,
                    last: row_to_job(&last)?,
                });
            }
        }
        Ok(chains)
    }

    async fn delete_jobs_by_root_chain_ids(
        &self,
        tx: &mut Self::Transaction,
        root_chain_ids: &[ChainId],
    ) -> Result<u64> {
        let conn = tx.connection();

        // SPEC_FULL.md §D.3: refuse (all-or-nothing) if any job outside the set
        // references one of the set's chains as a blocker.
        let referenced_from_outside: Vec<ChainId> = sqlx::query_scalar(
            "SELECT DISTINCT jb.blocked_by_chain_id \
             FROM job_blocker jb \
             JOIN job chain_owner ON chain_owner.id = jb.blocked_by_chain_id \
             JOIN job blocked_owner ON blocked_owner.id = jb.job_id \
             WHERE chain_owner.root_chain_id = ANY($1) \
               AND NOT (blocked_owner.root_chain_id = ANY($1))",
        )
        .bind(root_chain_ids)
        .fetch_all(&mut *conn)
        .await
        .map_err(QueuertError::storage)?;

        if !referenced_from_outside.is_empty() {
            return Err(QueuertError::BlockedByExternalChain(referenced_from_outside));
        }

        let result = retry_in_tx!(
            &self.retry,
            conn,
            sqlx::query("DELETE FROM job WHERE root_chain_id = ANY($1)")
                .bind(root_chain_ids)
                .execute(&mut *conn)
        )
        .map_err(QueuertError::storage)?;

        Ok(result.rows_affected())
    }
}

async fn find_key_dedup_candidate(
    conn: &mut sqlx::PgConnection,
    _chain_type_name: &str,
    dedup: &Deduplication,
    now: DateTime<Utc>,
) -> queuert_core::Result<Option<Job>> {
    let query = match dedup.scope {
        DeduplicationScope::All => format!(
            "SELECT {JOB_COLUMNS} FROM job \
             WHERE id = chain_id AND deduplication_key = $1 \
               AND ($2::timestamptz IS NULL OR created_at >= $2) \
             ORDER BY created_at DESC LIMIT 1"
        ),
        DeduplicationScope::Completed => format!(
            "SELECT {JOB_COLUMNS} FROM job starter \
             WHERE starter.id = starter.chain_id AND starter.deduplication_key = $1 \
               AND ($2::timestamptz IS NULL OR starter.created_at >= $2) \
               AND ( \
                   SELECT status FROM job \
                   WHERE chain_id = starter.chain_id \
                   ORDER BY created_at DESC, id DESC LIMIT 1 \
               ) <> 'completed'::job_status \
             ORDER BY starter.created_at DESC LIMIT 1"
        ),
    };
    let window_start = dedup.window_ms.map(|ms| now - chrono::Duration::milliseconds(ms));
    let row = sqlx::query(&query)
        .bind(&dedup.key)
        .bind(window_start)
        .fetch_optional(conn)
        .await
        .map_err(QueuertError::storage)?;
    row.as_ref().map(row_to_job).transpose()
}
