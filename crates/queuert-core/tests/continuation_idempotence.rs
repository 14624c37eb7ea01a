mod common;

use queuert_core::{NewJob, Schedule, StartJobChain, StateAdapter};

use common::test_engine;

/// Re-running the continuation a retried attempt would recompute returns the
/// *same* row instead of inserting a second one (`spec.md` §8 scenario 5, and the
/// idempotence law keyed on `(chain_id, origin_id)` uniqueness).
#[tokio::test]
async fn retried_continuation_dedups_against_the_first_row() {
    let engine = test_engine();

    let mut tx = engine.state().begin().await.unwrap();
    let chain = engine
        .start_job_chain(
            &mut tx,
            None,
            StartJobChain {
                type_name: "first",
                input: serde_json::json!({"value": 1}),
                blockers: &[],
                schedule: None,
                deduplication: None,
            },
        )
        .await
        .unwrap();
    engine.state().commit(tx).await.unwrap();

    let mut tx = engine.state().begin().await.unwrap();
    let completed = engine
        .complete_job_chain(&mut tx, None, chain.id, |_job| {
            (
                serde_json::Value::Null,
                Some(queuert_core::ContinueWith::new(
                    "second",
                    serde_json::json!({"continued": true}),
                )),
            )
        })
        .await
        .unwrap();
    engine.state().commit(tx).await.unwrap();

    let mut tx = engine.state().begin().await.unwrap();
    let chain_state = engine
        .state()
        .get_job_chain_by_id(&mut tx, completed.id)
        .await
        .unwrap()
        .expect("chain exists");
    let continuation = chain_state.last;
    assert_eq!(continuation.origin_id, Some(completed.id));
    engine.state().commit(tx).await.unwrap();

    // A retried attempt recomputes the identical continuation proposal; the
    // engine always mints a fresh id for the insert attempt, but storage must
    // still return the pre-existing row.
    let mut tx = engine.state().begin().await.unwrap();
    let retried = engine
        .state()
        .create_job(
            &mut tx,
            NewJob {
                id: queuert_core::JobId::new_v4(),
                type_name: "second".to_string(),
                chain_id: completed.chain_id,
                chain_type_name: completed.chain_type_name.clone(),
                root_chain_id: completed.root_chain_id,
                origin_id: Some(completed.id),
                input: serde_json::json!({"continued": true}),
                schedule: Schedule::now(),
                deduplication: None,
            },
        )
        .await
        .unwrap();
    engine.state().commit(tx).await.unwrap();

    assert!(retried.deduplicated);
    assert_eq!(retried.job.id, continuation.id);
}
