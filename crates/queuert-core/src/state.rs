//! The `StateAdapter` contract (`spec.md` §4.1).
//!
//! The engine is generic over a storage backend; this trait is the entire surface the
//! engine issues against it. Every method here either opens its own transaction
//! internally (the teacher's `JobStore::mark_failed` pattern) or is handed one the
//! caller already holds via [`StateAdapter::Transaction`], so that a client's own
//! business writes and the job-queue mutation they trigger commit atomically.

use async_trait::async_trait;

use crate::error::Result;
use crate::job::{ChainId, CreatedJob, Job, JobChain, JobId, NewJob, Schedule};

/// One `acquireJob` result: the locked-and-running row, plus whether another
/// acquirable row was visible (used by the worker loop to decide whether it's worth
/// trying another slot this tick).
#[derive(Debug, Clone)]
pub struct AcquiredJob {
    pub job: Job,
    pub has_more: bool,
}

/// Result of `addJobBlockers`: the (possibly blocked) job, and the blocker chain ids
/// that are not yet complete.
#[derive(Debug, Clone)]
pub struct BlockerOutcome {
    pub job: Job,
    pub incomplete_blocker_chain_ids: Vec<ChainId>,
}

/// Storage operations the engine issues. Implementors own dialect, connection
/// pooling, and the transient-error retry predicate (`spec.md` §4.1, last paragraph):
/// every method here should itself retry on the backend's transient-error class
/// before returning `Err`.
#[async_trait]
pub trait StateAdapter: Send + Sync + 'static {
    /// A transaction handle scoped to this backend. Application code using
    /// `start_job_chain`/`complete_job_chain` receives this same handle, so its own
    /// writes commit atomically with the job row mutation.
    type Transaction: Send + 'static;

    async fn begin(&self) -> Result<Self::Transaction>;
    async fn commit(&self, tx: Self::Transaction) -> Result<()>;
    async fn rollback(&self, tx: Self::Transaction) -> Result<()>;

    // ---- CRUD -----------------------------------------------------------------

    async fn create_job(&self, tx: &mut Self::Transaction, new_job: NewJob) -> Result<CreatedJob>;

    async fn get_job_by_id(&self, tx: &mut Self::Transaction, id: JobId) -> Result<Option<Job>>;

    /// Locks the row `FOR UPDATE` for the duration of the transaction.
    async fn get_job_for_update(
        &self,
        tx: &mut Self::Transaction,
        id: JobId,
    ) -> Result<Option<Job>>;

    /// The last (greatest `created_at`, tie-broken by id) job of `chain_id`, locked
    /// `FOR UPDATE`.
    async fn get_current_job_for_update(
        &self,
        tx: &mut Self::Transaction,
        chain_id: ChainId,
    ) -> Result<Option<Job>>;

    /// Root + current last job of the chain `job_id` belongs to.
    async fn get_job_chain_by_id(
        &self,
        tx: &mut Self::Transaction,
        job_id: JobId,
    ) -> Result<Option<JobChain>>;

    // ---- Acquisition ------------------------------------------------------------

    /// Minimum milliseconds until a `pending` job of one of `type_names` becomes
    /// acquirable. `Some(0)` if one is ready now, `None` if none exist.
    async fn get_next_job_available_in_ms(
        &self,
        tx: &mut Self::Transaction,
        type_names: &[String],
    ) -> Result<Option<i64>>;

    /// Atomically select, lock (`SKIP LOCKED`) and mark one pending row of
    /// `type_names` as `running`, incrementing `attempt`.
    async fn acquire_job(
        &self,
        tx: &mut Self::Transaction,
        type_names: &[String],
    ) -> Result<Option<AcquiredJob>>;

    // ---- Lease ------------------------------------------------------------------

    /// Unconditionally (re)establish the lease: `leased_by`, `leased_until`,
    /// `status=running`.
    async fn renew_job_lease(
        &self,
        tx: &mut Self::Transaction,
        id: JobId,
        worker_id: &str,
        duration_ms: i64,
    ) -> Result<Job>;

    /// Reclaim one `running` job of `type_names`, not in `ignored_ids`, whose lease
    /// has expired, returning it to `pending` with lease fields cleared.
    async fn remove_expired_job_lease(
        &self,
        tx: &mut Self::Transaction,
        type_names: &[String],
        ignored_ids: &[JobId],
    ) -> Result<Option<Job>>;

    // ---- Completion / reschedule --------------------------------------------------

    async fn complete_job(
        &self,
        tx: &mut Self::Transaction,
        id: JobId,
        output: serde_json::Value,
        worker_id: Option<&str>,
    ) -> Result<Job>;

    async fn reschedule_job(
        &self,
        tx: &mut Self::Transaction,
        id: JobId,
        schedule: Schedule,
        error: &str,
    ) -> Result<Job>;

    // ---- Blockers -----------------------------------------------------------------

    async fn add_job_blockers(
        &self,
        tx: &mut Self::Transaction,
        job_id: JobId,
        blocked_by_chain_ids: &[ChainId],
    ) -> Result<BlockerOutcome>;

    /// Every job blocked by `blocked_by_chain_id` whose every blocker is now
    /// complete transitions `blocked -> pending`. Returns the ids transitioned.
    async fn schedule_blocked_jobs(
        &self,
        tx: &mut Self::Transaction,
        blocked_by_chain_id: ChainId,
    ) -> Result<Vec<JobId>>;

    /// Ordered (root, last) pairs for every chain blocking `job_id`.
    async fn get_job_blockers(
        &self,
        tx: &mut Self::Transaction,
        job_id: JobId,
    ) -> Result<Vec<JobChain>>;

    // ---- Administrative (supplemented, `SPEC_FULL.md` §C) -------------------------

    /// Delete every job under the given root chain ids. Refuses (leaving storage
    /// untouched) if any job outside the set references one of these chains as a
    /// blocker (`SPEC_FULL.md` §D.3).
    async fn delete_jobs_by_root_chain_ids(
        &self,
        tx: &mut Self::Transaction,
        root_chain_ids: &[ChainId],
    ) -> Result<u64>;
}
