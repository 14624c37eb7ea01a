//! The Job row and its auxiliary types.
//!
//! A single entity, [`Job`], carries the whole state machine described in the design:
//! status transitions, chain lineage, lease ownership and retry bookkeeping all live on
//! one row. [`JobBlocker`] is the many-to-many join that backs fan-in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable, globally unique job identifier.
pub type JobId = Uuid;

/// Identity of the chain a job belongs to (equal to the first job's `id`).
pub type ChainId = Uuid;

/// One of the four states a job row can occupy. `Completed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting on one or more blocker chains to complete.
    Blocked,
    /// Eligible for acquisition once `scheduled_at` has passed.
    Pending,
    /// Held by a worker under an active lease.
    Running,
    /// Terminal. Has `completed_at` and no lease.
    Completed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed)
    }
}

/// A fully materialized job row, as returned by the [`crate::state::StateAdapter`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub type_name: String,
    pub chain_id: ChainId,
    pub chain_type_name: String,
    pub root_chain_id: ChainId,
    pub origin_id: Option<JobId>,

    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,

    pub status: JobStatus,

    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub completed_by: Option<String>,

    pub attempt: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_attempt_error: Option<String>,

    pub leased_by: Option<String>,
    pub leased_until: Option<DateTime<Utc>>,

    pub deduplication_key: Option<String>,
}

impl Job {
    /// A job is a chain starter iff its id is its own chain id.
    pub fn is_chain_starter(&self) -> bool {
        self.id == self.chain_id
    }
}

/// Join row recording that `job_id` is blocked on `blocked_by_chain_id`, in the order
/// it was registered (`index`), so handlers can reliably address `blockers[0]`, etc.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobBlocker {
    pub job_id: JobId,
    pub blocked_by_chain_id: ChainId,
    pub index: i32,
}

/// Root + current last job of the same chain. Resolves the "flat row vs. nested
/// object" open question in favor of a nested pair (see `SPEC_FULL.md` §D.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobChain {
    pub root: Job,
    pub last: Job,
}

impl JobChain {
    /// The terminal state of the chain is the status of its last job (invariant 5).
    pub fn status(&self) -> JobStatus {
        self.last.status
    }
}

/// When a new job (or chain) may next be acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Schedule {
    /// An absolute wall-clock instant.
    At(DateTime<Utc>),
    /// Relative to "now" at the moment the schedule is applied.
    AfterMs(i64),
}

impl Schedule {
    pub fn now() -> Self {
        Schedule::AfterMs(0)
    }

    pub fn resolve(self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Schedule::At(at) => at,
            Schedule::AfterMs(ms) => now + chrono::Duration::milliseconds(ms),
        }
    }
}

/// Scope for key-based deduplication (`spec.md` §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DeduplicationScope {
    /// Suppress a new chain only while an existing chain with the key is not yet
    /// completed. The default - behaves like a singleton across active instances.
    #[default]
    Completed,
    /// Suppress regardless of status.
    All,
}

/// Opt-in key deduplication parameters attached at chain start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deduplication {
    pub key: String,
    pub scope: DeduplicationScope,
    pub window_ms: Option<i64>,
}

/// Parameters for inserting a new job row. Used both for chain starters and for
/// continuations; the engine fills in `chain_id`/`root_chain_id`/`origin_id` as
/// appropriate before handing this to the adapter.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Generated by the engine (not the adapter) so that a chain starter's
    /// `chain_id` can be set equal to it in the same insert.
    pub id: JobId,
    pub type_name: String,
    pub chain_id: ChainId,
    pub chain_type_name: String,
    pub root_chain_id: ChainId,
    pub origin_id: Option<JobId>,
    pub input: serde_json::Value,
    pub schedule: Schedule,
    pub deduplication: Option<Deduplication>,
}

/// Outcome of inserting a job row: either it was created fresh, or an existing row
/// satisfied one of the dedup rules in `spec.md` §4.5 and was returned instead.
#[derive(Debug, Clone)]
pub struct CreatedJob {
    pub job: Job,
    pub deduplicated: bool,
}
