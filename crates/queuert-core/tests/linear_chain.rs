mod common;

use std::time::Duration;

use queuert_core::{
    async_trait, AttemptContext, AttemptDecision, ContinueWith, JobTypeHandler, StartJobChain,
    StateAdapter, WorkerBuilder, WorkerConfig,
};
use queuert_testing::{MemoryNotifyAdapter, MemoryStateAdapter};

use common::{test_engine, PermissiveRegistry};

struct Step1;

#[async_trait]
impl JobTypeHandler<MemoryStateAdapter, MemoryNotifyAdapter, PermissiveRegistry> for Step1 {
    async fn handle(
        &self,
        ctx: &AttemptContext<MemoryStateAdapter, MemoryNotifyAdapter, PermissiveRegistry>,
    ) -> anyhow::Result<AttemptDecision> {
        Ok(AttemptDecision::Continued {
            output: serde_json::json!({"step": 1}),
            continue_with: ContinueWith::new("step2", serde_json::json!({"from": ctx.job().input})),
        })
    }
}

struct Step2;

#[async_trait]
impl JobTypeHandler<MemoryStateAdapter, MemoryNotifyAdapter, PermissiveRegistry> for Step2 {
    async fn handle(
        &self,
        _ctx: &AttemptContext<MemoryStateAdapter, MemoryNotifyAdapter, PermissiveRegistry>,
    ) -> anyhow::Result<AttemptDecision> {
        Ok(AttemptDecision::Completed {
            output: serde_json::json!({"step": 2, "done": true}),
        })
    }
}

/// A two-step chain (`spec.md` §8 scenario 1): step1 continues into step2, which
/// completes, and the chain's terminal output is step2's.
#[tokio::test]
async fn linear_chain_runs_to_completion() {
    let engine = test_engine();

    let mut tx = engine.state().begin().await.unwrap();
    let chain = engine
        .start_job_chain(
            &mut tx,
            None,
            StartJobChain {
                type_name: "step1",
                input: serde_json::json!({"x": 1}),
                blockers: &[],
                schedule: None,
                deduplication: None,
            },
        )
        .await
        .unwrap();
    engine.state().commit(tx).await.unwrap();

    let worker = WorkerBuilder::new(engine.clone())
        .implement_job_type("step1", Step1)
        .implement_job_type("step2", Step2)
        .start(WorkerConfig {
            poll_interval: Duration::from_millis(20),
            ..WorkerConfig::default()
        });

    let output = engine
        .wait_for_job_chain_completion(&chain, Duration::from_millis(20), Duration::from_secs(5))
        .await
        .expect("chain should complete");

    assert_eq!(output, serde_json::json!({"step": 2, "done": true}));

    worker.stop().await;
}
