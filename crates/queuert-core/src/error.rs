//! Error taxonomy for the engine (`spec.md` §4.9, §7).

use thiserror::Error;

use crate::job::{ChainId, JobId};

/// Raised by a [`crate::registry::Registry`] hook when a payload, continuation or
/// blocker set doesn't match the type it was validated against.
#[derive(Debug, Error, Clone)]
#[error("job type validation failed for `{type_name}`: {reason}")]
pub struct JobTypeValidationError {
    pub type_name: String,
    pub reason: String,
}

impl JobTypeValidationError {
    pub fn new(type_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            reason: reason.into(),
        }
    }
}

/// The tagged reason an in-flight attempt's cancellation token was tripped (`spec.md`
/// §4.6 step 4, §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationReason {
    /// Lease renewal found a different `leased_by` owner.
    TakenByAnotherWorker,
    /// Lease renewal found the job already `completed`.
    AlreadyCompleted,
    /// The worker's `stop()` was called.
    Stopped,
}

/// Top-level error type returned by engine operations.
#[derive(Debug, Error)]
pub enum QueuertError {
    #[error(transparent)]
    Validation(#[from] JobTypeValidationError),

    #[error("job {0} was already completed by another attempt")]
    AlreadyCompleted(JobId),

    #[error("job {0} is leased by another worker")]
    TakenByAnotherWorker(JobId),

    #[error("no job found with id {0}")]
    JobNotFound(JobId),

    #[error(
        "refusing to delete jobs under root chains {0:?}: referenced as a blocker from outside the set"
    )]
    BlockedByExternalChain(Vec<ChainId>),

    #[error("timed out waiting for chain {0} to complete")]
    WaitTimeout(ChainId),

    #[error("storage error")]
    Storage(#[source] anyhow::Error),

    #[error("notify adapter error")]
    Notify(#[source] anyhow::Error),
}

impl QueuertError {
    pub fn storage(err: impl Into<anyhow::Error>) -> Self {
        QueuertError::Storage(err.into())
    }

    pub fn notify(err: impl Into<anyhow::Error>) -> Self {
        QueuertError::Notify(err.into())
    }
}

pub type Result<T> = std::result::Result<T, QueuertError>;
