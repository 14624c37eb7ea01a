//! Chain/continuation types (`spec.md` §4.7) and the handle returned to clients.

use crate::job::{ChainId, JobStatus, Schedule};

/// Returned by `start_job_chain` and passed to `wait_for_job_chain_completion` /
/// used as a blocker reference.
#[derive(Debug, Clone)]
pub struct ChainHandle {
    pub id: ChainId,
    pub type_name: String,
    pub input: serde_json::Value,
    pub status: JobStatus,
}

/// The single mechanism for chain extension (`spec.md` §4.7). Spawns a job with the
/// same `chain_id`, `origin_id = current_job.id`. Branching is expressed by varying
/// `type_name`; looping by repeating it; fan-out is not supported here - use
/// separate chains as blockers for fan-in.
#[derive(Debug, Clone)]
pub struct ContinueWith {
    pub type_name: String,
    pub input: serde_json::Value,
    pub schedule: Option<Schedule>,
}

impl ContinueWith {
    pub fn new(type_name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            type_name: type_name.into(),
            input,
            schedule: None,
        }
    }

    pub fn scheduled(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }
}
