mod common;

use std::time::Duration;

use queuert_core::{JobStatus, StartJobChain, StateAdapter};

use common::test_engine;

/// Worker A acquires a job and lets its lease lapse (simulated crash); the reaper
/// returns it to `pending` and worker B completes it, with no duplicate output
/// (`spec.md` §8 scenario 3).
#[tokio::test]
async fn expired_lease_is_reaped_and_completed_exactly_once() {
    let engine = test_engine();

    let mut tx = engine.state().begin().await.unwrap();
    let chain = engine
        .start_job_chain(
            &mut tx,
            None,
            StartJobChain {
                type_name: "reap_me",
                input: serde_json::json!({}),
                blockers: &[],
                schedule: None,
                deduplication: None,
            },
        )
        .await
        .unwrap();
    engine.state().commit(tx).await.unwrap();

    let type_names = vec!["reap_me".to_string()];

    // Worker A acquires and leases for 10ms, then "crashes" (never renews again).
    let mut tx = engine.state().begin().await.unwrap();
    let acquired = engine
        .state()
        .acquire_job(&mut tx, &type_names)
        .await
        .unwrap()
        .expect("job should be acquirable");
    engine.state().commit(tx).await.unwrap();

    let mut tx = engine.state().begin().await.unwrap();
    engine
        .state()
        .renew_job_lease(&mut tx, acquired.job.id, "worker-a", 10)
        .await
        .unwrap();
    engine.state().commit(tx).await.unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;

    // Worker B's reaper reclaims the expired lease.
    let mut tx = engine.state().begin().await.unwrap();
    let reaped = engine
        .state()
        .remove_expired_job_lease(&mut tx, &type_names, &[])
        .await
        .unwrap()
        .expect("lease should have expired");
    engine.state().commit(tx).await.unwrap();
    assert_eq!(reaped.status, JobStatus::Pending);
    assert_eq!(reaped.id, acquired.job.id);

    // Worker B re-acquires and completes it.
    let mut tx = engine.state().begin().await.unwrap();
    let reacquired = engine
        .state()
        .acquire_job(&mut tx, &type_names)
        .await
        .unwrap()
        .expect("reaped job should be acquirable again");
    engine.state().commit(tx).await.unwrap();
    assert_eq!(reacquired.job.attempt, 2, "second acquisition increments attempt");

    let mut tx = engine.state().begin().await.unwrap();
    engine
        .state()
        .renew_job_lease(&mut tx, reacquired.job.id, "worker-b", 30_000)
        .await
        .unwrap();
    engine.state().commit(tx).await.unwrap();

    let mut tx = engine.state().begin().await.unwrap();
    let completed = engine
        .complete_job_chain(&mut tx, None, chain.id, |_job| {
            (serde_json::json!({"by": "worker-b"}), None)
        })
        .await
        .unwrap();
    engine.state().commit(tx).await.unwrap();

    assert_eq!(completed.status, JobStatus::Completed);
    assert_eq!(completed.completed_by, None, "workerless finalize records no worker id");
    assert_eq!(completed.output, Some(serde_json::json!({"by": "worker-b"})));
}
