//! # Queuert
//!
//! A durable, transactionally-consistent job queue: a persistent scheduler that lets
//! an application atomically enqueue work alongside its own business writes, then
//! processes that work with exactly-once completion semantics, retries with backoff,
//! lease-based recovery from crashes, and composable multi-step workflows.
//!
//! ## Architecture
//!
//! ```text
//! Client (in its own transaction)
//!     │
//!     ▼ start_job_chain() / complete_job_chain()
//! StateAdapter ─────────────────────────────────────┐
//!     │                                             │
//!     ▼ acquire_job()                               │
//! Worker.run_loop()                                 │
//!     │                                             │
//!     ├─► prepare ─► process ─► finalize ───────────┤
//!     │                                             │
//!     └─► lease renewal ticker / reaper             │
//!                                                    │
//!                                         NotifyAdapter (jobScheduled,
//!                                         jobChainCompleted, jobOwnershipLost)
//! ```
//!
//! ## Key invariants
//!
//! 1. `status = running` iff `leased_by` and `leased_until` are both set.
//! 2. `status = completed` implies `completed_at` is set and the lease is clear.
//! 3. `(chain_id, origin_id)` is unique - a job may be continued at most once.
//! 4. A `blocked` job always has at least one incomplete blocker chain.
//! 5. A chain's terminal state is the status of its last-created job.
//!
//! ## What this is not
//!
//! Queuert is **not**:
//! - A cron runtime (recurring schedules are jobs that re-enqueue themselves)
//! - A distributed consensus system (correctness rests on the store's isolation)
//! - FIFO (ordering is best-effort by `scheduled_at`, within a chain only strict)

mod backoff;
mod chain;
mod client;
mod error;
mod job;
mod notify;
mod registry;
mod state;
mod worker;

pub use backoff::{jittered, LeaseConfig, RetryConfig};
pub use chain::{ChainHandle, ContinueWith};
pub use client::{Engine, StartJobChain};
pub use error::{CancellationReason, JobTypeValidationError, QueuertError, Result};
pub use job::{
    ChainId, CreatedJob, Deduplication, DeduplicationScope, Job, JobBlocker, JobChain, JobId,
    JobStatus, NewJob, Schedule,
};
pub use notify::{NotifyAdapter, NotifyBuffer, NotifyReceiver};
pub use registry::{ContinuationProposal, Registry};
pub use state::{AcquiredJob, BlockerOutcome, StateAdapter};
pub use worker::{
    AttemptContext, AttemptDecision, CancellationToken, JobAttemptMiddleware, JobTypeHandler,
    MiddlewareNext, PrepareMode, Worker, WorkerBuilder, WorkerConfig,
};

pub use async_trait::async_trait;
