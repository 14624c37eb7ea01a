mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use queuert_core::{
    async_trait, AttemptContext, AttemptDecision, JobTypeHandler, RetryConfig, StartJobChain,
    StateAdapter, WorkerBuilder, WorkerConfig,
};
use queuert_testing::{MemoryNotifyAdapter, MemoryStateAdapter};

use common::PermissiveRegistry;

/// Fails on the first three attempts, succeeds on the fourth (`spec.md` §8 scenario
/// 2).
struct FlakyUntilFourth {
    attempts: Arc<AtomicU32>,
}

#[async_trait]
impl JobTypeHandler<MemoryStateAdapter, MemoryNotifyAdapter, PermissiveRegistry> for FlakyUntilFourth {
    async fn handle(
        &self,
        ctx: &AttemptContext<MemoryStateAdapter, MemoryNotifyAdapter, PermissiveRegistry>,
    ) -> anyhow::Result<AttemptDecision> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if ctx.job().attempt < 4 {
            anyhow::bail!("transient failure on attempt {}", ctx.job().attempt);
        }
        Ok(AttemptDecision::Completed {
            output: serde_json::Value::Null,
        })
    }
}

#[tokio::test]
async fn failed_attempts_reschedule_with_exponential_backoff() {
    let engine = common::test_engine();
    let attempts = Arc::new(AtomicU32::new(0));

    let mut tx = engine.state().begin().await.unwrap();
    let chain = engine
        .start_job_chain(
            &mut tx,
            None,
            StartJobChain {
                type_name: "flaky",
                input: serde_json::json!({}),
                blockers: &[],
                schedule: None,
                deduplication: None,
            },
        )
        .await
        .unwrap();
    engine.state().commit(tx).await.unwrap();

    let worker = WorkerBuilder::new(engine.clone())
        .implement_job_type(
            "flaky",
            FlakyUntilFourth {
                attempts: attempts.clone(),
            },
        )
        .start(WorkerConfig {
            poll_interval: Duration::from_millis(5),
            default_retry: RetryConfig {
                initial_delay_ms: 10,
                multiplier: 2.0,
                max_delay_ms: 100,
            },
            ..WorkerConfig::default()
        });

    engine
        .wait_for_job_chain_completion(&chain, Duration::from_millis(5), Duration::from_secs(5))
        .await
        .expect("chain should eventually complete after retries");

    assert_eq!(attempts.load(Ordering::SeqCst), 4);

    worker.stop().await;
}
