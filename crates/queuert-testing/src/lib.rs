//! In-memory [`StateAdapter`] and [`NotifyAdapter`] implementations for exercising
//! the engine and worker loop without a real database (`spec.md` §8's test
//! scenarios are written against this crate).
//!
//! The state adapter serializes every transaction behind a single async mutex;
//! there is no row-level locking to emulate, so a transaction is simply "hold the
//! lock, mutate a snapshot, commit swaps it back in or rollback discards it."

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use queuert_core::{
    AcquiredJob, BlockerOutcome, ChainId, CreatedJob, Job, JobBlocker, JobChain, JobId, JobStatus,
    NewJob, NotifyAdapter, NotifyReceiver, QueuertError, Result, Schedule, StateAdapter,
};
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    blockers: Vec<JobBlocker>,
}

impl Inner {
    fn current_job_for_chain(&self, chain_id: ChainId) -> Option<&Job> {
        self.jobs
            .values()
            .filter(|j| j.chain_id == chain_id)
            .max_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
    }

    fn job_chain(&self, job_id: JobId) -> Option<JobChain> {
        let job = self.jobs.get(&job_id)?;
        let root = self.jobs.get(&job.chain_id)?.clone();
        let last = self.current_job_for_chain(job.chain_id)?.clone();
        Some(JobChain { root, last })
    }
}

/// An in-memory [`StateAdapter`]. Cheap to clone; every handle shares the same
/// underlying table.
#[derive(Clone)]
pub struct MemoryStateAdapter {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryStateAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStateAdapter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }
}

/// A held exclusive lock over the table plus the pre-transaction snapshot, restored
/// on rollback.
pub struct MemoryTransaction {
    guard: OwnedMutexGuard<Inner>,
    snapshot: Inner,
}

fn matches_dedup_window(created_at: chrono::DateTime<Utc>, window_ms: Option<i64>, now: chrono::DateTime<Utc>) -> bool {
    match window_ms {
        None => true,
        Some(ms) => created_at >= now - chrono::Duration::milliseconds(ms),
    }
}

#[async_trait]
impl StateAdapter for MemoryStateAdapter {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> Result<Self::Transaction> {
        let guard = self.inner.clone().lock_owned().await;
        let snapshot = guard.clone();
        Ok(MemoryTransaction { guard, snapshot })
    }

    async fn commit(&self, _tx: Self::Transaction) -> Result<()> {
        Ok(())
    }

    async fn rollback(&self, mut tx: Self::Transaction) -> Result<()> {
        *tx.guard = tx.snapshot;
        Ok(())
    }

    async fn create_job(&self, tx: &mut Self::Transaction, new_job: NewJob) -> Result<CreatedJob> {
        let now = Utc::now();
        let is_chain_starter = new_job.id == new_job.chain_id;

        // Continuation dedup (structural, always active): spec.md §4.5 rule 1.
        if let Some(origin_id) = new_job.origin_id {
            if let Some(existing) = tx.guard.jobs.values().find(|j| {
                j.chain_id == new_job.chain_id && j.origin_id == Some(origin_id)
            }) {
                return Ok(CreatedJob {
                    job: existing.clone(),
                    deduplicated: true,
                });
            }
        }

        // Key dedup (opt-in, chain-starters only): spec.md §4.5 rule 2.
        if is_chain_starter {
            if let Some(dedup) = &new_job.deduplication {
                let existing = tx.guard.jobs.values().find(|j| {
                    j.is_chain_starter()
                        && j.deduplication_key.as_deref() == Some(dedup.key.as_str())
                        && matches_dedup_window(j.created_at, dedup.window_ms, now)
                        && match dedup.scope {
                            queuert_core::DeduplicationScope::All => true,
                            queuert_core::DeduplicationScope::Completed => {
                                tx.guard
                                    .current_job_for_chain(j.chain_id)
                                    .map(|last| last.status != JobStatus::Completed)
                                    .unwrap_or(true)
                            }
                        }
                });
                if let Some(existing) = existing {
                    return Ok(CreatedJob {
                        job: existing.clone(),
                        deduplicated: true,
                    });
                }
            }
        }

        let job = Job {
            id: new_job.id,
            type_name: new_job.type_name,
            chain_id: new_job.chain_id,
            chain_type_name: new_job.chain_type_name,
            root_chain_id: new_job.root_chain_id,
            origin_id: new_job.origin_id,
            input: new_job.input,
            output: None,
            status: JobStatus::Pending,
            created_at: now,
            scheduled_at: new_job.schedule.resolve(now),
            completed_at: None,
            completed_by: None,
            attempt: 0,
            last_attempt_at: None,
            last_attempt_error: None,
            leased_by: None,
            leased_until: None,
            deduplication_key: if is_chain_starter {
                new_job.deduplication.map(|d| d.key)
            } else {
                None
            },
        };
        tx.guard.jobs.insert(job.id, job.clone());
        Ok(CreatedJob {
            job,
            deduplicated: false,
        })
    }

    async fn get_job_by_id(&self, tx: &mut Self::Transaction, id: JobId) -> Result<Option<Job>> {
        Ok(tx.guard.jobs.get(&id).cloned())
    }

    async fn get_job_for_update(
        &self,
        tx: &mut Self::Transaction,
        id: JobId,
    ) -> Result<Option<Job>> {
        Ok(tx.guard.jobs.get(&id).cloned())
    }

    async fn get_current_job_for_update(
        &self,
        tx: &mut Self::Transaction,
        chain_id: ChainId,
    ) -> Result<Option<Job>> {
        Ok(tx.guard.current_job_for_chain(chain_id).cloned())
    }

    async fn get_job_chain_by_id(
        &self,
        tx: &mut Self::Transaction,
        job_id: JobId,
    ) -> Result<Option<JobChain>> {
        Ok(tx.guard.job_chain(job_id))
    }

    async fn get_next_job_available_in_ms(
        &self,
        tx: &mut Self::Transaction,
        type_names: &[String],
    ) -> Result<Option<i64>> {
        let now = Utc::now();
        let min_wait = tx
            .guard
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && type_names.contains(&j.type_name))
            .map(|j| (j.scheduled_at - now).num_milliseconds().max(0))
            .min();
        Ok(min_wait)
    }

    async fn acquire_job(
        &self,
        tx: &mut Self::Transaction,
        type_names: &[String],
    ) -> Result<Option<AcquiredJob>> {
        let now = Utc::now();
        let mut candidates: Vec<JobId> = tx
            .guard
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Pending
                    && j.scheduled_at <= now
                    && type_names.contains(&j.type_name)
            })
            .map(|j| j.id)
            .collect();
        candidates.sort_by_key(|id| {
            let j = &tx.guard.jobs[id];
            (j.scheduled_at, *id)
        });

        let Some(chosen) = candidates.first().copied() else {
            return Ok(None);
        };
        let has_more = candidates.len() > 1;

        let job = tx.guard.jobs.get_mut(&chosen).expect("candidate exists");
        job.status = JobStatus::Running;
        job.attempt += 1;
        let job = job.clone();

        Ok(Some(AcquiredJob { job, has_more }))
    }

    async fn renew_job_lease(
        &self,
        tx: &mut Self::Transaction,
        id: JobId,
        worker_id: &str,
        duration_ms: i64,
    ) -> Result<Job> {
        let job = tx
            .guard
            .jobs
            .get_mut(&id)
            .ok_or(QueuertError::JobNotFound(id))?;
        job.leased_by = Some(worker_id.to_string());
        job.leased_until = Some(Utc::now() + chrono::Duration::milliseconds(duration_ms));
        job.status = JobStatus::Running;
        Ok(job.clone())
    }

    async fn remove_expired_job_lease(
        &self,
        tx: &mut Self::Transaction,
        type_names: &[String],
        ignored_ids: &[JobId],
    ) -> Result<Option<Job>> {
        let now = Utc::now();
        let expired = tx
            .guard
            .jobs
            .values()
            .find(|j| {
                j.status == JobStatus::Running
                    && j.leased_until.map(|until| until < now).unwrap_or(false)
                    && type_names.contains(&j.type_name)
                    && !ignored_ids.contains(&j.id)
            })
            .map(|j| j.id);

        let Some(id) = expired else {
            return Ok(None);
        };
        let job = tx.guard.jobs.get_mut(&id).expect("expired job exists");
        job.status = JobStatus::Pending;
        job.leased_by = None;
        job.leased_until = None;
        Ok(Some(job.clone()))
    }

    async fn complete_job(
        &self,
        tx: &mut Self::Transaction,
        id: JobId,
        output: serde_json::Value,
        worker_id: Option<&str>,
    ) -> Result<Job> {
        let job = tx
            .guard
            .jobs
            .get_mut(&id)
            .ok_or(QueuertError::JobNotFound(id))?;
        if job.status == JobStatus::Completed {
            return Err(QueuertError::AlreadyCompleted(id));
        }
        if let Some(worker_id) = worker_id {
            if job.leased_by.as_deref() != Some(worker_id) {
                return Err(QueuertError::TakenByAnotherWorker(id));
            }
        }
        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        job.completed_by = worker_id.map(|s| s.to_string());
        job.output = Some(output);
        job.leased_by = None;
        job.leased_until = None;
        Ok(job.clone())
    }

    async fn reschedule_job(
        &self,
        tx: &mut Self::Transaction,
        id: JobId,
        schedule: Schedule,
        error: &str,
    ) -> Result<Job> {
        let now = Utc::now();
        let job = tx
            .guard
            .jobs
            .get_mut(&id)
            .ok_or(QueuertError::JobNotFound(id))?;
        job.scheduled_at = schedule.resolve(now);
        job.last_attempt_at = Some(now);
        job.last_attempt_error = Some(error.to_string());
        job.leased_by = None;
        job.leased_until = None;
        job.status = JobStatus::Pending;
        Ok(job.clone())
    }

    async fn add_job_blockers(
        &self,
        tx: &mut Self::Transaction,
        job_id: JobId,
        blocked_by_chain_ids: &[ChainId],
    ) -> Result<BlockerOutcome> {
        let start_index = tx
            .guard
            .blockers
            .iter()
            .filter(|b| b.job_id == job_id)
            .count() as i32;
        for (offset, chain_id) in blocked_by_chain_ids.iter().enumerate() {
            tx.guard.blockers.push(JobBlocker {
                job_id,
                blocked_by_chain_id: *chain_id,
                index: start_index + offset as i32,
            });
        }

        let incomplete: Vec<ChainId> = blocked_by_chain_ids
            .iter()
            .filter(|chain_id| {
                tx.guard
                    .current_job_for_chain(**chain_id)
                    .map(|last| last.status != JobStatus::Completed)
                    .unwrap_or(true)
            })
            .copied()
            .collect();

        if !incomplete.is_empty() {
            if let Some(job) = tx.guard.jobs.get_mut(&job_id) {
                job.status = JobStatus::Blocked;
            }
        }

        let job = tx
            .guard
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(QueuertError::JobNotFound(job_id))?;

        Ok(BlockerOutcome {
            job,
            incomplete_blocker_chain_ids: incomplete,
        })
    }

    async fn schedule_blocked_jobs(
        &self,
        tx: &mut Self::Transaction,
        blocked_by_chain_id: ChainId,
    ) -> Result<Vec<JobId>> {
        let candidate_job_ids: Vec<JobId> = tx
            .guard
            .blockers
            .iter()
            .filter(|b| b.blocked_by_chain_id == blocked_by_chain_id)
            .map(|b| b.job_id)
            .collect();

        let mut transitioned = Vec::new();
        for job_id in candidate_job_ids {
            let is_blocked = tx
                .guard
                .jobs
                .get(&job_id)
                .map(|j| j.status == JobStatus::Blocked)
                .unwrap_or(false);
            if !is_blocked {
                continue;
            }

            let all_complete = tx
                .guard
                .blockers
                .iter()
                .filter(|b| b.job_id == job_id)
                .all(|b| {
                    tx.guard
                        .current_job_for_chain(b.blocked_by_chain_id)
                        .map(|last| last.status == JobStatus::Completed)
                        .unwrap_or(false)
                });

            if all_complete {
                let now = Utc::now();
                let job = tx.guard.jobs.get_mut(&job_id).expect("checked above");
                job.status = JobStatus::Pending;
                job.scheduled_at = now;
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
        let mut entries: Vec<&JobBlocker> = tx
            .guard
            .blockers
            .iter()
            .filter(|b| b.job_id == job_id)
            .collect();
        entries.sort_by_key(|b| b.index);

        Ok(entries
            .into_iter()
            .filter_map(|b| tx.guard.job_chain(b.blocked_by_chain_id))
            .collect())
    }

    async fn delete_jobs_by_root_chain_ids(
        &self,
        tx: &mut Self::Transaction,
        root_chain_ids: &[ChainId],
    ) -> Result<u64> {
        let in_set_chain_ids: std::collections::HashSet<ChainId> = tx
            .guard
            .jobs
            .values()
            .filter(|j| root_chain_ids.contains(&j.root_chain_id))
            .map(|j| j.chain_id)
            .collect();

        let referenced_from_outside: Vec<ChainId> = tx
            .guard
            .blockers
            .iter()
            .filter(|b| in_set_chain_ids.contains(&b.blocked_by_chain_id))
            .filter(|b| {
                tx.guard
                    .jobs
                    .get(&b.job_id)
                    .map(|j| !root_chain_ids.contains(&j.root_chain_id))
                    .unwrap_or(false)
            })
            .map(|b| b.blocked_by_chain_id)
            .collect();

        if !referenced_from_outside.is_empty() {
            return Err(QueuertError::BlockedByExternalChain(referenced_from_outside));
        }

        let doomed: Vec<JobId> = tx
            .guard
            .jobs
            .values()
            .filter(|j| root_chain_ids.contains(&j.root_chain_id))
            .map(|j| j.id)
            .collect();
        let count = doomed.len() as u64;
        for id in &doomed {
            tx.guard.jobs.remove(id);
        }
        tx.guard
            .blockers
            .retain(|b| !doomed.contains(&b.job_id) && !in_set_chain_ids.contains(&b.blocked_by_chain_id));

        Ok(count)
    }
}

/// An in-memory [`NotifyAdapter`] backed by [`tokio::sync::broadcast`] channels,
/// created lazily per key on first subscription. Publishing to a key nobody has
/// subscribed to yet is a no-op, matching the contract.
#[derive(Clone)]
pub struct MemoryNotifyAdapter {
    scheduled: Arc<broadcast::Sender<()>>,
    chain_completed: Arc<DashMap<ChainId, broadcast::Sender<()>>>,
    ownership_lost: Arc<DashMap<JobId, broadcast::Sender<()>>>,
}

impl Default for MemoryNotifyAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNotifyAdapter {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self {
            scheduled: Arc::new(tx),
            chain_completed: Arc::new(DashMap::new()),
            ownership_lost: Arc::new(DashMap::new()),
        }
    }
}

fn sender_for<K: Eq + std::hash::Hash + Copy>(map: &DashMap<K, broadcast::Sender<()>>, key: K) -> broadcast::Sender<()> {
    map.entry(key)
        .or_insert_with(|| broadcast::channel(16).0)
        .clone()
}

#[async_trait]
impl NotifyAdapter for MemoryNotifyAdapter {
    async fn publish_job_scheduled(&self, _type_name: &str, _count: u32) -> Result<()> {
        let _ = self.scheduled.send(());
        Ok(())
    }

    async fn publish_job_chain_completed(&self, chain_id: ChainId) -> Result<()> {
        if let Some(sender) = self.chain_completed.get(&chain_id) {
            let _ = sender.send(());
        }
        Ok(())
    }

    async fn publish_job_ownership_lost(&self, job_id: JobId) -> Result<()> {
        if let Some(sender) = self.ownership_lost.get(&job_id) {
            let _ = sender.send(());
        }
        Ok(())
    }

    async fn subscribe_job_scheduled(&self, _type_names: &[String]) -> Result<NotifyReceiver> {
        Ok(NotifyReceiver::new(self.scheduled.subscribe()))
    }

    async fn subscribe_job_chain_completed(&self, chain_id: ChainId) -> Result<NotifyReceiver> {
        let sender = sender_for(&self.chain_completed, chain_id);
        Ok(NotifyReceiver::new(sender.subscribe()))
    }

    async fn subscribe_job_ownership_lost(&self, job_id: JobId) -> Result<NotifyReceiver> {
        let sender = sender_for(&self.ownership_lost, job_id);
        Ok(NotifyReceiver::new(sender.subscribe()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use queuert_core::{async_trait, Deduplication, DeduplicationScope};

    fn new_job(id: JobId, type_name: &str) -> NewJob {
        NewJob {
            id,
            type_name: type_name.to_string(),
            chain_id: id,
            chain_type_name: type_name.to_string(),
            root_chain_id: id,
            origin_id: None,
            input: serde_json::json!({}),
            schedule: Schedule::now(),
            deduplication: None,
        }
    }

    #[tokio::test]
    async fn acquire_job_marks_running_and_increments_attempt() {
        let store = MemoryStateAdapter::new();
        let id = JobId::new_v4();
        let mut tx = store.begin().await.unwrap();
        store.create_job(&mut tx, new_job(id, "send_email")).await.unwrap();
        let acquired = store
            .acquire_job(&mut tx, &["send_email".to_string()])
            .await
            .unwrap()
            .expect("job should be acquirable");
        assert_eq!(acquired.job.status, JobStatus::Running);
        assert_eq!(acquired.job.attempt, 1);
        assert!(!acquired.has_more);
    }

    #[tokio::test]
    async fn key_dedup_completed_scope_suppresses_while_active() {
        let store = MemoryStateAdapter::new();
        let mut tx = store.begin().await.unwrap();

        let mut first = new_job(JobId::new_v4(), "onboard");
        first.deduplication = Some(Deduplication {
            key: "user-42".into(),
            scope: DeduplicationScope::Completed,
            window_ms: None,
        });
        let created_first = store.create_job(&mut tx, first.clone()).await.unwrap();
        assert!(!created_first.deduplicated);

        let mut second = new_job(JobId::new_v4(), "onboard");
        second.deduplication = first.deduplication.clone();
        let created_second = store.create_job(&mut tx, second).await.unwrap();
        assert!(created_second.deduplicated);
        assert_eq!(created_second.job.id, created_first.job.id);
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let store = MemoryStateAdapter::new();
        let id = JobId::new_v4();
        let mut tx = store.begin().await.unwrap();
        store.create_job(&mut tx, new_job(id, "t")).await.unwrap();
        store.rollback(tx).await.unwrap();

        let mut tx2 = store.begin().await.unwrap();
        assert!(store.get_job_by_id(&mut tx2, id).await.unwrap().is_none());
    }

    #[async_trait]
    trait _AssertSendSync: Send + Sync {}
    impl _AssertSendSync for MemoryStateAdapter {}
    impl _AssertSendSync for MemoryNotifyAdapter {}
}
