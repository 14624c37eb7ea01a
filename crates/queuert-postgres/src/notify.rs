//! Postgres `NotifyAdapter` (`spec.md` §4.2), backed by `LISTEN`/`NOTIFY`.
//!
//! Each of the three channels maps to one Postgres channel name: `jobScheduled` is
//! a single fixed channel carrying the `type_name` as payload (workers filter
//! client-side against their watched set, the same way `seesaw-job-postgres`'s
//! reclaim/cleanup helpers run unconditionally and let callers filter results);
//! `jobChainCompleted`/`jobOwnershipLost` are per-id channels built from the uuid.
//! `pg_notify(channel, payload)` is a no-op when nobody is listening, matching the
//! contract's "publish with no listeners" rule without any extra bookkeeping.

use async_trait::async_trait;
use queuert_core::{ChainId, JobId, NotifyAdapter, NotifyReceiver, QueuertError, Result};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tokio::sync::broadcast;
use tracing::warn;

const SCHEDULED_CHANNEL: &str = "queuert_job_scheduled";

fn chain_completed_channel(chain_id: ChainId) -> String {
    format!("queuert_chain_completed_{}", chain_id.simple())
}

fn ownership_lost_channel(job_id: JobId) -> String {
    format!("queuert_ownership_lost_{}", job_id.simple())
}

/// Bridges a Postgres `LISTEN`/`NOTIFY` channel to the broadcast-channel shape
/// [`NotifyReceiver`] expects. One background task owns the `PgListener` for the
/// channel's lifetime; it's spawned lazily on first subscription and exits once the
/// last receiver is dropped.
#[derive(Clone)]
pub struct PgNotifyAdapter {
    pool: PgPool,
}

impl PgNotifyAdapter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(QueuertError::storage)?;
        Ok(())
    }

    async fn subscribe(&self, channel: String) -> Result<NotifyReceiver> {
        let (tx, rx) = broadcast::channel(64);
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let mut listener = match PgListener::connect_with(&pool).await {
                Ok(listener) => listener,
                Err(err) => {
                    warn!(error = %err, channel, "failed to connect notify listener");
                    return;
                }
            };
            if let Err(err) = listener.listen(&channel).await {
                warn!(error = %err, channel, "failed to LISTEN on channel");
                return;
            }
            loop {
                tokio::select! {
                    notification = listener.recv() => {
                        match notification {
                            Ok(_) => {
                                if tx.send(()).is_err() {
                                    return;
                                }
                            }
                            Err(err) => {
                                warn!(error = %err, channel, "notify listener connection lost");
                                return;
                            }
                        }
                    }
                    _ = tx.closed() => return,
                }
            }
        });
        Ok(NotifyReceiver::new(rx))
    }
}

#[async_trait]
impl NotifyAdapter for PgNotifyAdapter {
    async fn publish_job_scheduled(&self, type_name: &str, _count: u32) -> Result<()> {
        self.publish(SCHEDULED_CHANNEL, type_name).await
    }

    async fn publish_job_chain_completed(&self, chain_id: ChainId) -> Result<()> {
        self.publish(&chain_completed_channel(chain_id), "").await
    }

    async fn publish_job_ownership_lost(&self, job_id: JobId) -> Result<()> {
        self.publish(&ownership_lost_channel(job_id), "").await
    }

    async fn subscribe_job_scheduled(&self, _type_names: &[String]) -> Result<NotifyReceiver> {
        // Filtering by watched type happens client-side in the worker loop; every
        // watcher listens on the one shared channel.
        self.subscribe(SCHEDULED_CHANNEL.to_string()).await
    }

    async fn subscribe_job_chain_completed(&self, chain_id: ChainId) -> Result<NotifyReceiver> {
        self.subscribe(chain_completed_channel(chain_id)).await
    }

    async fn subscribe_job_ownership_lost(&self, job_id: JobId) -> Result<NotifyReceiver> {
        self.subscribe(ownership_lost_channel(job_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_names_are_stable_per_id() {
        let id = ChainId::new_v4();
        assert_eq!(chain_completed_channel(id), chain_completed_channel(id));
    }
}
