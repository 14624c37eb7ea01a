mod common;

use std::time::Duration;

use queuert_core::{
    async_trait, AttemptContext, AttemptDecision, ContinueWith, JobTypeHandler, StartJobChain,
    StateAdapter, WorkerBuilder, WorkerConfig,
};
use queuert_postgres::{PgNotifyAdapter, PgStateAdapter};
use serial_test::serial;

use common::{PermissiveRegistry, PgHarness};

struct Step1;

#[async_trait]
impl JobTypeHandler<PgStateAdapter, PgNotifyAdapter, PermissiveRegistry> for Step1 {
    async fn handle(
        &self,
        ctx: &AttemptContext<PgStateAdapter, PgNotifyAdapter, PermissiveRegistry>,
    ) -> anyhow::Result<AttemptDecision> {
        Ok(AttemptDecision::Continued {
            output: serde_json::json!({"step": 1}),
            continue_with: ContinueWith::new("step2", serde_json::json!({"from": ctx.job().input})),
        })
    }
}

struct Step2;

#[async_trait]
impl JobTypeHandler<PgStateAdapter, PgNotifyAdapter, PermissiveRegistry> for Step2 {
    async fn handle(
        &self,
        _ctx: &AttemptContext<PgStateAdapter, PgNotifyAdapter, PermissiveRegistry>,
    ) -> anyhow::Result<AttemptDecision> {
        Ok(AttemptDecision::Completed {
            output: serde_json::json!({"step": 2, "done": true}),
        })
    }
}

/// End-to-end scenario 1 (`spec.md` §8) against a real Postgres container: a chain
/// that continues once and then completes, its terminal output surfaced by
/// `wait_for_job_chain_completion` via `LISTEN`/`NOTIFY`.
#[tokio::test]
#[serial]
async fn linear_chain_runs_to_completion_against_postgres() {
    let harness = PgHarness::start().await;
    let engine = &harness.engine;

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
            poll_interval: Duration::from_millis(50),
            ..WorkerConfig::default()
        });

    let output = engine
        .wait_for_job_chain_completion(&chain, Duration::from_millis(50), Duration::from_secs(10))
        .await
        .expect("chain should complete");

    assert_eq!(output, serde_json::json!({"step": 2, "done": true}));

    worker.stop().await;
}
