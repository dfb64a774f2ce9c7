//! Test: Store outages - runs finish, free their slot and own up to lost writes

use crate::helpers::*;
use piaflow::core::{RunStatus, StageKind, StageStatus};
use piaflow::error::PipelineError;
use piaflow::persistence::RunStore;
use std::time::Duration;

/// A finalize that keeps failing shows up on the next read, and a cancel never
/// overwrites the outcome the stages produced
#[tokio::test]
async fn test_lost_finalize_reported_until_store_recovers() {
    let (bed, flaky) = TestBed::flaky();
    flaky.fail_always(StoreOp::FinalizeRun);

    let handle = bed
        .runner
        .trigger(&app("web", "true", "true", ""), None)
        .await
        .unwrap();
    let run_id = handle.id();
    let status = tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .unwrap();
    assert_eq!(status, RunStatus::Succeeded);

    assert!(!bed.runner.is_active(run_id));
    assert!(!bed.runner.gate().is_busy("web"));

    let stored = bed.store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Running);
    assert!(stored.finished_at.is_none());

    assert!(matches!(
        bed.runner.get_run(run_id).await,
        Err(PipelineError::StoreUnavailable(_))
    ));
    assert!(matches!(
        bed.runner.cancel(run_id).await,
        Err(PipelineError::StoreUnavailable(_))
    ));
    assert!(matches!(
        bed.runner.list_runs("web", 10, 0).await,
        Err(PipelineError::StoreUnavailable(_))
    ));

    flaky.heal();
    let run = bed.runner.get_run(run_id).await.unwrap();
    assert_finished(&run, RunStatus::Succeeded);
    assert_eq!(run.status, run.derived_status());

    assert!(matches!(
        bed.runner.cancel(run_id).await,
        Err(PipelineError::AlreadyFinished(_))
    ));
    let after = bed.store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(after.status, RunStatus::Succeeded);
}

/// One failed finalize is retried before the run's task ends
#[tokio::test]
async fn test_single_finalize_failure_is_retried() {
    let (bed, flaky) = TestBed::flaky();
    flaky.fail(StoreOp::FinalizeRun, 1);

    let run = bed.run_to_end(&app("web", "true", "true", "")).await;
    assert_finished(&run, RunStatus::Succeeded);
    assert!(!bed.runner.gate().is_busy("web"));
}

/// Stage writes lost during the run are replayed once the store is back
#[tokio::test]
async fn test_lost_stage_writes_replayed() {
    let (bed, flaky) = TestBed::flaky();
    flaky.fail_always(StoreOp::UpdateStage);

    let handle = bed
        .runner
        .trigger(&app("api", "echo compiled", "false", ""), None)
        .await
        .unwrap();
    let run_id = handle.id();
    let status = tokio::time::timeout(Duration::from_secs(10), handle.wait())
        .await
        .unwrap();
    assert_eq!(status, RunStatus::Failed);
    assert!(!bed.runner.gate().is_busy("api"));

    let stored = bed.store.get_run(run_id).await.unwrap().unwrap();
    assert!(stored.stages.is_empty());
    assert!(!stored.status.is_terminal());
    assert!(matches!(
        bed.runner.get_run(run_id).await,
        Err(PipelineError::StoreUnavailable(_))
    ));

    flaky.heal();
    let run = bed.runner.get_run(run_id).await.unwrap();
    assert_finished(&run, RunStatus::Failed);
    assert_stages(
        &run,
        &[
            (StageKind::Checkout, StageStatus::Succeeded),
            (StageKind::Build, StageStatus::Succeeded),
            (StageKind::Test, StageStatus::Failed),
        ],
    );
    let build = run.stage(StageKind::Build).unwrap();
    assert!(build.output.contains("compiled"));
    assert_eq!(run.stage(StageKind::Test).unwrap().exit_code, Some(1));
}

/// A few dropped stage writes are caught up before the run is finalized
#[tokio::test]
async fn test_transient_stage_write_failures() {
    let (bed, flaky) = TestBed::flaky();
    // The pending rows written at trigger time
    flaky.fail(StoreOp::UpdateStage, 2);

    let run = bed.run_to_end(&app("api", "true", "true", "true")).await;
    assert_finished(&run, RunStatus::Succeeded);
    assert_eq!(run.stages.len(), 4);
    assert!(run.stages.iter().all(|s| s.status == StageStatus::Succeeded));
}

/// A run whose start was not recorded still ends with a start time
#[tokio::test]
async fn test_lost_start_recorded_at_close() {
    let (bed, flaky) = TestBed::flaky();
    flaky.fail(StoreOp::MarkRunning, 1);

    let run = bed.run_to_end(&app("cli", "true", "true", "")).await;
    assert_finished(&run, RunStatus::Succeeded);
    assert!(run.started_at.is_some());
    assert!(!bed.runner.gate().is_busy("cli"));
    assert_eq!(bed.runner.active_runs(), 0);
}

/// Lost writes of one run do not hold the application back
#[tokio::test]
async fn test_retrigger_while_finalize_outstanding() {
    let (bed, flaky) = TestBed::flaky();
    flaky.fail_always(StoreOp::FinalizeRun);

    let first = bed
        .runner
        .trigger(&app("web", "true", "true", ""), None)
        .await
        .unwrap();
    let first_id = first.id();
    first.wait().await;

    flaky.heal();
    let second = bed.run_to_end(&app("web", "true", "true", "")).await;
    assert_finished(&second, RunStatus::Succeeded);

    let runs = bed.runner.list_runs("web", 10, 0).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[1].id, first_id);
    assert_finished(&runs[1], RunStatus::Succeeded);
}
