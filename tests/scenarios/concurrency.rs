//! Test: Concurrency - one run per application, bounded runs overall

use crate::helpers::*;
use piaflow::core::{RunStatus, StageKind, StageStatus};
use piaflow::error::PipelineError;
use piaflow::persistence::RunStore;
use std::time::{Duration, Instant};

/// A second trigger while a run is active is rejected without a record
#[tokio::test]
async fn test_same_app_rejected_while_running() {
    let bed = TestBed::new();
    let app = app("busy", "sleep 1", "true", "");

    let first = bed.runner.trigger(&app, None).await.unwrap();
    let second = bed.runner.trigger(&app, None).await;
    match second {
        Err(PipelineError::Busy(id)) => assert_eq!(id, "busy"),
        other => panic!("expected Busy, got {:?}", other.map(|h| h.id())),
    }
    assert!(PipelineError::Busy("busy".to_string()).is_retryable());

    assert_eq!(bed.store.list_runs("busy", 10, 0).await.unwrap().len(), 1);

    assert_eq!(first.wait().await, RunStatus::Succeeded);
    let third = bed.runner.trigger(&app, None).await.unwrap();
    assert_eq!(third.wait().await, RunStatus::Succeeded);
    assert_eq!(bed.store.list_runs("busy", 10, 0).await.unwrap().len(), 2);
}

/// Different applications run side by side
#[tokio::test]
async fn test_different_apps_run_in_parallel() {
    let bed = TestBed::new();
    let start = Instant::now();

    let a = bed.runner.trigger(&app("alpha", "sleep 1", "true", ""), None).await.unwrap();
    let b = bed.runner.trigger(&app("beta", "sleep 1", "true", ""), None).await.unwrap();

    assert_eq!(a.wait().await, RunStatus::Succeeded);
    assert_eq!(b.wait().await, RunStatus::Succeeded);
    assert!(
        start.elapsed() < Duration::from_millis(1900),
        "runs were serialized: {:?}",
        start.elapsed()
    );
}

/// With one global slot, another application waits in pending
#[tokio::test]
async fn test_global_bound_queues_other_apps() {
    let bed = TestBed::with_max_concurrent(1);

    let a = bed.runner.trigger(&app("first", "sleep 1", "true", ""), None).await.unwrap();
    bed.wait_for_stage(a.id(), StageKind::Build, StageStatus::Running).await;

    let b = bed.runner.trigger(&app("second", "true", "true", ""), None).await.unwrap();
    let b_id = b.id();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let queued = bed.store.get_run(b_id).await.unwrap().unwrap();
    assert_eq!(queued.status, RunStatus::Pending);
    assert!(queued.stages.iter().all(|s| s.status == StageStatus::Pending));

    let a_id = a.id();
    assert_eq!(a.wait().await, RunStatus::Succeeded);
    assert_eq!(b.wait().await, RunStatus::Succeeded);

    let first = bed.store.get_run(a_id).await.unwrap().unwrap();
    let second = bed.store.get_run(b_id).await.unwrap().unwrap();
    assert!(second.started_at.unwrap() >= first.finished_at.unwrap());
    assert_eq!(bed.runner.gate().available_slots(), 1);
}
