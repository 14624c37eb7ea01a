mod common;

use std::time::Duration;

use queuert_core::{
    async_trait, AttemptContext, AttemptDecision, JobTypeHandler, StartJobChain, StateAdapter,
    WorkerBuilder, WorkerConfig,
};
use queuert_postgres::{PgNotifyAdapter, PgStateAdapter};
use serial_test::serial;

use common::{PermissiveRegistry, PgHarness};

struct Auth;

#[async_trait]
impl JobTypeHandler<PgStateAdapter, PgNotifyAdapter, PermissiveRegistry> for Auth {
    async fn handle(
        &self,
        _ctx: &AttemptContext<PgStateAdapter, PgNotifyAdapter, PermissiveRegistry>,
    ) -> anyhow::Result<AttemptDecision> {
        Ok(AttemptDecision::Completed {
            output: serde_json::json!({"token": "abc"}),
        })
    }
}

struct Main;

#[async_trait]
impl JobTypeHandler<PgStateAdapter, PgNotifyAdapter, PermissiveRegistry> for Main {
    async fn handle(
        &self,
        _ctx: &AttemptContext<PgStateAdapter, PgNotifyAdapter, PermissiveRegistry>,
    ) -> anyhow::Result<AttemptDecision> {
        Ok(AttemptDecision::Completed {
            output: serde_json::json!({"ran": true}),
        })
    }
}

/// End-to-end scenario 4 (`spec.md` §8): `main` starts blocked on `auth` and only
/// becomes eligible for acquisition once `auth`'s chain completes, against a real
/// Postgres `job_blocker` join table.
#[tokio::test]
#[serial]
async fn blocked_job_waits_for_blocker_chain_against_postgres() {
    let harness = PgHarness::start().await;
    let engine = &harness.engine;

    let mut tx = engine.state().begin().await.unwrap();
    let auth_chain = engine
        .start_job_chain(
            &mut tx,
            None,
            StartJobChain {
                type_name: "auth",
                input: serde_json::json!({"token": "abc"}),
                blockers: &[],
                schedule: None,
                deduplication: None,
            },
        )
        .await
        .unwrap();
    engine.state().commit(tx).await.unwrap();

    let mut tx = engine.state().begin().await.unwrap();
    let main_chain = engine
        .start_job_chain(
            &mut tx,
            None,
            StartJobChain {
                type_name: "main",
                input: serde_json::json!({}),
                blockers: std::slice::from_ref(&auth_chain),
                schedule: None,
                deduplication: None,
            },
        )
        .await
        .unwrap();
    engine.state().commit(tx).await.unwrap();

    assert_eq!(main_chain.status, queuert_core::JobStatus::Blocked);

    let worker = WorkerBuilder::new(engine.clone())
        .implement_job_type("auth", Auth)
        .implement_job_type("main", Main)
        .start(WorkerConfig {
            poll_interval: Duration::from_millis(50),
            ..WorkerConfig::default()
        });

    let output = engine
        .wait_for_job_chain_completion(&main_chain, Duration::from_millis(50), Duration::from_secs(10))
        .await
        .expect("main chain should complete once auth unblocks it");

    assert_eq!(output, serde_json::json!({"ran": true}));

    worker.stop().await;
}
