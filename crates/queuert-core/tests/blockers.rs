mod common;

use std::time::Duration;

use queuert_core::{
    async_trait, AttemptContext, AttemptDecision, ChainHandle, JobStatus, JobTypeHandler,
    StartJobChain, StateAdapter, WorkerBuilder, WorkerConfig,
};
use queuert_testing::{MemoryNotifyAdapter, MemoryStateAdapter};

use common::PermissiveRegistry;

struct Completes(serde_json::Value);

#[async_trait]
impl JobTypeHandler<MemoryStateAdapter, MemoryNotifyAdapter, PermissiveRegistry> for Completes {
    async fn handle(
        &self,
        _ctx: &AttemptContext<MemoryStateAdapter, MemoryNotifyAdapter, PermissiveRegistry>,
    ) -> anyhow::Result<AttemptDecision> {
        Ok(AttemptDecision::Completed {
            output: self.0.clone(),
        })
    }
}

/// `main` is created blocked on `auth`; it transitions to `pending` only once `auth`
/// completes (`spec.md` §8 scenario 4).
#[tokio::test]
async fn blocked_job_starts_only_after_its_blocker_completes() {
    let engine = common::test_engine();

    let mut tx = engine.state().begin().await.unwrap();
    let auth = engine
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

    let main = engine
        .start_job_chain(
            &mut tx,
            None,
            StartJobChain {
                type_name: "main",
                input: serde_json::json!({}),
                blockers: std::slice::from_ref(&ChainHandle {
                    id: auth.id,
                    type_name: auth.type_name.clone(),
                    input: auth.input.clone(),
                    status: auth.status,
                }),
                schedule: None,
                deduplication: None,
            },
        )
        .await
        .unwrap();
    engine.state().commit(tx).await.unwrap();

    assert_eq!(main.status, JobStatus::Blocked);

    let worker = WorkerBuilder::new(engine.clone())
        .implement_job_type("auth", Completes(serde_json::json!({"authorized": true})))
        .implement_job_type("main", Completes(serde_json::json!({"result": "done"})))
        .start(WorkerConfig {
            poll_interval: Duration::from_millis(10),
            ..WorkerConfig::default()
        });

    let main_output = engine
        .wait_for_job_chain_completion(&main, Duration::from_millis(10), Duration::from_secs(5))
        .await
        .expect("main should complete once auth unblocks it");

    assert_eq!(main_output, serde_json::json!({"result": "done"}));

    worker.stop().await;
}
