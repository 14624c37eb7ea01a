mod common;

use std::time::Duration;

use queuert_core::{Deduplication, DeduplicationScope, StartJobChain, StateAdapter};

use common::test_engine;

/// Starting a chain again with the same dedup key inside its window returns the
/// same chain with `deduplicated=true`; once the window elapses, a fresh chain is
/// created (`spec.md` §8 scenario 6).
#[tokio::test]
async fn key_dedup_respects_its_window() {
    let engine = test_engine();

    let start = |engine: &common::TestEngine| {
        let dedup = Deduplication {
            key: "sync".to_string(),
            scope: DeduplicationScope::All,
            window_ms: Some(150),
        };
        let engine = engine.clone();
        async move {
            let mut tx = engine.state().begin().await.unwrap();
            let chain = engine
                .start_job_chain(
                    &mut tx,
                    None,
                    StartJobChain {
                        type_name: "sync_job",
                        input: serde_json::json!({}),
                        blockers: &[],
                        schedule: None,
                        deduplication: Some(dedup),
                    },
                )
                .await
                .unwrap();
            engine.state().commit(tx).await.unwrap();
            chain
        }
    };

    let first = start(&engine).await;
    let second = start(&engine).await;
    assert_eq!(second.id, first.id, "second call within the window dedups");

    tokio::time::sleep(Duration::from_millis(200)).await;

    let third = start(&engine).await;
    assert_ne!(third.id, first.id, "call after the window starts a fresh chain");
}
