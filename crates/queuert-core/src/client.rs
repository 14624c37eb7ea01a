//! Client-facing operations (`spec.md` §4.4): `start_job_chain`,
//! `complete_job_chain`, `wait_for_job_chain_completion`, `with_notify`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::chain::{ChainHandle, ContinueWith};
use crate::error::{QueuertError, Result};
use crate::job::{ChainId, Deduplication, Job, JobStatus, NewJob, Schedule};
use crate::notify::{record_or_warn, NotifyAdapter, NotifyBuffer};
use crate::registry::{ContinuationProposal, Registry};
use crate::state::StateAdapter;

/// Parameters for starting a new chain.
pub struct StartJobChain<'a> {
    pub type_name: &'a str,
    pub input: serde_json::Value,
    pub blockers: &'a [ChainHandle],
    pub schedule: Option<Schedule>,
    pub deduplication: Option<Deduplication>,
}

/// Ties a [`StateAdapter`], [`NotifyAdapter`] and [`Registry`] together into the
/// engine's client surface. Cheap to clone (everything behind an `Arc`).
pub struct Engine<A: StateAdapter, N: NotifyAdapter, R: Registry> {
    pub(crate) state: Arc<A>,
    pub(crate) notify: Arc<N>,
    pub(crate) registry: Arc<R>,
}

impl<A: StateAdapter, N: NotifyAdapter, R: Registry> Clone for Engine<A, N, R> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            notify: self.notify.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl<A: StateAdapter, N: NotifyAdapter, R: Registry> Engine<A, N, R> {
    pub fn new(state: Arc<A>, notify: Arc<N>, registry: Arc<R>) -> Self {
        Self {
            state,
            notify,
            registry,
        }
    }

    pub fn state(&self) -> &Arc<A> {
        &self.state
    }

    pub fn notify_adapter(&self) -> &Arc<N> {
        &self.notify
    }

    pub fn registry(&self) -> &Arc<R> {
        &self.registry
    }

    /// Establish an explicit notify buffer for the duration of `f`. `jobScheduled`
    /// notifications recorded during `f` are flushed once it returns successfully,
    /// in practice once the caller's own transaction (opened inside `f`) has
    /// committed.
    pub async fn with_notify<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&NotifyBuffer) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let buffer = NotifyBuffer::new();
        let result = f(&buffer).await;
        if result.is_ok() {
            buffer.flush(self.notify.as_ref()).await?;
        }
        result
    }

    /// Start a new chain. Must be called with a transaction the caller already
    /// opened (so the caller's own business writes commit alongside it).
    #[instrument(skip(self, tx, notify, params), fields(type_name = params.type_name))]
    pub async fn start_job_chain(
        &self,
        tx: &mut A::Transaction,
        notify: Option<&NotifyBuffer>,
        params: StartJobChain<'_>,
    ) -> Result<ChainHandle> {
        self.registry.validate_entry(params.type_name).await?;
        let input = self
            .registry
            .parse_input(params.type_name, params.input)
            .await?;

        if !params.blockers.is_empty() {
            let proposals: Vec<ContinuationProposal> = params
                .blockers
                .iter()
                .map(|b| ContinuationProposal {
                    type_name: b.type_name.clone(),
                    input: b.input.clone(),
                })
                .collect();
            self.registry
                .validate_blockers(params.type_name, &proposals)
                .await?;
        }

        let id = Uuid::new_v4();
        let new_job = NewJob {
            id,
            type_name: params.type_name.to_string(),
            chain_id: id,
            chain_type_name: params.type_name.to_string(),
            root_chain_id: id,
            origin_id: None,
            input,
            schedule: params.schedule.unwrap_or_else(Schedule::now),
            deduplication: params.deduplication,
        };

        let created = self.state.create_job(tx, new_job).await?;
        let mut job = created.job;

        if !created.deduplicated && !params.blockers.is_empty() {
            let blocker_ids: Vec<ChainId> = params.blockers.iter().map(|b| b.id).collect();
            let outcome = self.state.add_job_blockers(tx, job.id, &blocker_ids).await?;
            job = outcome.job;
        }

        if !created.deduplicated && job.status == JobStatus::Pending {
            record_or_warn(notify, &job.type_name);
        }

        info!(
            job_id = %job.id,
            chain_id = %job.chain_id,
            deduplicated = created.deduplicated,
            status = ?job.status,
            "chain started"
        );

        Ok(ChainHandle {
            id: job.chain_id,
            type_name: job.type_name.clone(),
            input: job.input.clone(),
            status: job.status,
        })
    }

    /// Workerless completion: finalize the chain's current last job from client code
    /// rather than a worker attempt. `complete` may call `continue_with` at most
    /// once, same as a worker's `complete(cb)`.
    pub async fn complete_job_chain<F>(
        &self,
        tx: &mut A::Transaction,
        notify: Option<&NotifyBuffer>,
        chain_id: ChainId,
        complete: F,
    ) -> Result<Job>
    where
        F: FnOnce(Job) -> (serde_json::Value, Option<ContinueWith>),
    {
        let job = self
            .state
            .get_current_job_for_update(tx, chain_id)
            .await?
            .ok_or(QueuertError::JobNotFound(chain_id))?;

        if job.status == JobStatus::Completed {
            return Err(QueuertError::AlreadyCompleted(job.id));
        }

        let type_name = job.type_name.clone();
        let job_id = job.id;
        let (output, continuation) = complete(job);

        self.finalize(tx, notify, job_id, &type_name, output, continuation, None)
            .await
    }

    /// Shared finalize path for both workerless completion and worker attempts
    /// (`spec.md` §4.6 step 3 "Finalize").
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn finalize(
        &self,
        tx: &mut A::Transaction,
        notify: Option<&NotifyBuffer>,
        job_id: crate::job::JobId,
        from_type_name: &str,
        output: serde_json::Value,
        continuation: Option<ContinueWith>,
        worker_id: Option<&str>,
    ) -> Result<Job> {
        let output = self.registry.parse_output(from_type_name, output).await?;
        let job = self.state.complete_job(tx, job_id, output, worker_id).await?;

        if let Some(continue_with) = continuation {
            let proposal = ContinuationProposal {
                type_name: continue_with.type_name.clone(),
                input: continue_with.input.clone(),
            };
            self.registry
                .validate_continue_with(from_type_name, &proposal)
                .await?;
            let validated_input = self
                .registry
                .parse_input(&continue_with.type_name, continue_with.input)
                .await?;

            let next = NewJob {
                id: Uuid::new_v4(),
                type_name: continue_with.type_name.clone(),
                chain_id: job.chain_id,
                chain_type_name: job.chain_type_name.clone(),
                root_chain_id: job.root_chain_id,
                origin_id: Some(job.id),
                input: validated_input,
                schedule: continue_with.schedule.unwrap_or_else(Schedule::now),
                deduplication: None,
            };
            let created = self.state.create_job(tx, next).await?;
            if !created.deduplicated {
                record_or_warn(notify, &created.job.type_name);
            }
        }

        let chain_now = self
            .state
            .get_job_chain_by_id(tx, job.id)
            .await?
            .ok_or(QueuertError::JobNotFound(job.id))?;

        if chain_now.status() == JobStatus::Completed {
            let transitioned = self
                .state
                .schedule_blocked_jobs(tx, job.chain_id)
                .await?;
            for unblocked_job_id in &transitioned {
                info!(job_id = %unblocked_job_id, chain_id = %job.chain_id, "unblocked");
            }
            if let Err(err) = self
                .notify
                .publish_job_chain_completed(job.chain_id)
                .await
            {
                tracing::warn!(error = %err, chain_id = %job.chain_id, "failed to publish chain completion notification");
            }
        }

        Ok(job)
    }

    /// Subscribe to `jobChainCompleted`, then poll `get_job_chain_by_id` on
    /// `poll_interval` as a safety net against missed notifications. Returns the
    /// terminal output, or `Err(QueuertError::WaitTimeout)`.
    pub async fn wait_for_job_chain_completion(
        &self,
        chain: &ChainHandle,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let mut receiver = self.notify.subscribe_job_chain_completed(chain.id).await?;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(chain_state) = self.poll_chain(chain.id).await? {
                return Ok(chain_state);
            }

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(QueuertError::WaitTimeout(chain.id));
            }

            tokio::select! {
                _ = receiver.recv() => {}
                _ = tokio::time::sleep(poll_interval.min(remaining)) => {}
                _ = tokio::time::sleep(remaining) => {
                    return Err(QueuertError::WaitTimeout(chain.id));
                }
            }
        }
    }

    async fn poll_chain(&self, chain_id: ChainId) -> Result<Option<serde_json::Value>> {
        let mut tx = self.state.begin().await?;
        let chain = self.state.get_job_chain_by_id(&mut tx, chain_id).await?;
        self.state.commit(tx).await?;
        match chain {
            Some(chain) if chain.status() == JobStatus::Completed => {
                Ok(Some(chain.last.output.unwrap_or(serde_json::Value::Null)))
            }
            _ => Ok(None),
        }
    }

    /// Reject a root-chain-id set for deletion if any job outside it blocks on one of
    /// its chains; otherwise deletes every job under the set (`SPEC_FULL.md` §D.3).
    pub async fn delete_jobs_by_root_chain_ids(
        &self,
        tx: &mut A::Transaction,
        root_chain_ids: &[ChainId],
    ) -> Result<u64> {
        self.state
            .delete_jobs_by_root_chain_ids(tx, root_chain_ids)
            .await
    }

    #[allow(dead_code)]
    pub(crate) fn now() -> chrono::DateTime<Utc> {
        Utc::now()
    }
}
