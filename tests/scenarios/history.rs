//! Test: History - listing and inspecting runs

use crate::helpers::*;
use piaflow::core::RunStatus;
use piaflow::error::PipelineError;

/// Runs are listed newest first, per application, with paging
#[tokio::test]
async fn test_list_newest_first_per_app() {
    let bed = TestBed::new();
    let alpha = app("alpha", "true", "true", "");
    let beta = app("beta", "true", "true", "");

    let a1 = bed.run_to_end(&alpha).await.id;
    let b1 = bed.run_to_end(&beta).await.id;
    let a2 = bed.run_to_end(&alpha).await.id;
    let a3 = bed.run_to_end(&alpha).await.id;

    let runs = bed.runner.list_runs("alpha", 10, 0).await.unwrap();
    let ids: Vec<_> = runs.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![a3, a2, a1]);
    assert!(runs.iter().all(|r| r.app_id == "alpha"));

    let page: Vec<_> = bed
        .runner
        .list_runs("alpha", 2, 1)
        .await
        .unwrap()
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(page, vec![a2, a1]);

    let betas = bed.runner.list_runs("beta", 10, 0).await.unwrap();
    assert_eq!(betas.len(), 1);
    assert_eq!(betas[0].id, b1);

    assert!(bed.runner.list_runs("gamma", 10, 0).await.unwrap().is_empty());
}

/// The triggering identity is kept on the run
#[tokio::test]
async fn test_triggered_by_recorded() {
    let bed = TestBed::new();
    let handle = bed
        .runner
        .trigger(&app("audited", "true", "true", ""), Some("alice"))
        .await
        .unwrap();
    let run_id = handle.id();
    handle.wait().await;

    let run = bed.runner.get_run(run_id).await.unwrap();
    assert_eq!(run.triggered_by.as_deref(), Some("alice"));
    assert_eq!(run.status, RunStatus::Succeeded);
    assert_eq!(run.derived_status(), RunStatus::Succeeded);
}

/// Looking up a missing run is an error, not an empty record
#[tokio::test]
async fn test_get_unknown_run() {
    let bed = TestBed::new();
    assert!(matches!(
        bed.runner.get_run(99).await,
        Err(PipelineError::RunNotFound(99))
    ));
}
