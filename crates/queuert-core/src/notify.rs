//! The `NotifyAdapter` contract (`spec.md` §4.2) and the explicit notify-buffer
//! context that replaces the source implementation's ambient task-local
//! (`SPEC_FULL.md` §9 / the `withNotify` design note).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::warn;

use crate::error::Result;
use crate::job::ChainId;

/// A live subscription to one of the three notify channels. `recv` resolves once per
/// delivered notification; dropping the receiver releases the underlying
/// subscription (the "async unsubscribe handle" of `spec.md` §4.2 is
/// [`NotifyReceiver::unsubscribe`], provided explicitly for callers that want to wait
/// on the release).
pub struct NotifyReceiver {
    inner: tokio::sync::broadcast::Receiver<()>,
}

impl NotifyReceiver {
    pub fn new(inner: tokio::sync::broadcast::Receiver<()>) -> Self {
        Self { inner }
    }

    /// Wait for the next notification on this channel. Lagged deliveries (the
    /// receiver fell behind a broadcast channel's buffer) are treated as a single
    /// notification, matching the "at-least-once to live listeners" guarantee.
    pub async fn recv(&mut self) -> Result<()> {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match self.inner.recv().await {
                Ok(()) => return Ok(()),
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return Ok(()),
            }
        }
    }

    /// Explicit unsubscribe; equivalent to dropping the receiver.
    pub async fn unsubscribe(self) -> Result<()> {
        drop(self);
        Ok(())
    }
}

/// Pub/sub fan-out for wake-ups. Publishing to a channel with no listeners is a
/// no-op, never an error.
#[async_trait]
pub trait NotifyAdapter: Send + Sync + 'static {
    /// Fired once per transaction commit that scheduled `count` new jobs of
    /// `type_name`.
    async fn publish_job_scheduled(&self, type_name: &str, count: u32) -> Result<()>;

    /// Fired when the last job of `chain_id` transitions to `completed`.
    async fn publish_job_chain_completed(&self, chain_id: ChainId) -> Result<()>;

    /// Fired when a worker detects it no longer owns a job it was running.
    async fn publish_job_ownership_lost(&self, job_id: crate::job::JobId) -> Result<()>;

    /// Subscribe to `jobScheduled` for any of `type_names`.
    async fn subscribe_job_scheduled(&self, type_names: &[String]) -> Result<NotifyReceiver>;

    /// Subscribe to `jobChainCompleted` for one chain.
    async fn subscribe_job_chain_completed(&self, chain_id: ChainId) -> Result<NotifyReceiver>;

    /// Subscribe to `jobOwnershipLost` for one job.
    async fn subscribe_job_ownership_lost(
        &self,
        job_id: crate::job::JobId,
    ) -> Result<NotifyReceiver>;
}

/// Ambient buffer for `jobScheduled` notifications accumulated during
/// [`crate::client::Engine::with_notify`]. Flushed to the [`NotifyAdapter`] once the
/// wrapped closure returns successfully, which in practice is once the caller's own
/// transaction has committed.
#[derive(Default)]
pub struct NotifyBuffer {
    scheduled: Mutex<HashMap<String, u32>>,
}

impl NotifyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_scheduled(&self, type_name: &str) {
        let mut guard = self.scheduled.lock().expect("notify buffer mutex poisoned");
        *guard.entry(type_name.to_string()).or_insert(0) += 1;
    }

    pub(crate) async fn flush<N: NotifyAdapter>(&self, notify: &N) -> Result<()> {
        let entries: Vec<(String, u32)> = {
            let mut guard = self.scheduled.lock().expect("notify buffer mutex poisoned");
            guard.drain().collect()
        };
        for (type_name, count) in entries {
            notify.publish_job_scheduled(&type_name, count).await?;
        }
        Ok(())
    }
}

/// Record a scheduled job either into an explicit buffer, or, absent one, log the
/// absence and skip the wake-up. Correctness is preserved (polling finds the job);
/// only latency suffers.
pub(crate) fn record_or_warn(buffer: Option<&NotifyBuffer>, type_name: &str) {
    match buffer {
        Some(buffer) => buffer.record_scheduled(type_name),
        None => warn!(
            type_name,
            event = "notify_context_absence",
            "no notify buffer in scope; job was created without a wake-up, polling will still find it"
        ),
    }
}
