//! Test: SQLite store - runs survive in the database

#![cfg(feature = "sqlite")]

use crate::helpers::*;
use piaflow::core::{RunStatus, RunnerSettings, StageKind, StageStatus};
use piaflow::execution::PipelineRunner;
use piaflow::persistence::{RunStore, SqliteRunStore};
use std::sync::Arc;

/// A full run recorded in SQLite reads back identically after reopening
#[tokio::test]
async fn test_run_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("db").join("runs.db");
    let db_path = db_path.to_string_lossy().to_string();
    let work = dir.path().join("work");

    let run_id = {
        let store = Arc::new(SqliteRunStore::new(&db_path).await.unwrap());
        let runner = PipelineRunner::with_checkout(
            store,
            &RunnerSettings::new(&work),
            LocalCheckout::default(),
        );
        let handle = runner
            .trigger(&app("stored", "echo hi", "false", "true"), Some("admin"))
            .await
            .unwrap();
        let run_id = handle.id();
        assert_eq!(handle.wait().await, RunStatus::Failed);
        run_id
    };

    let store = SqliteRunStore::new(&db_path).await.unwrap();
    let run = store.get_run(run_id).await.unwrap().unwrap();

    assert_finished(&run, RunStatus::Failed);
    assert_eq!(run.triggered_by.as_deref(), Some("admin"));
    assert_stages(
        &run,
        &[
            (StageKind::Checkout, StageStatus::Succeeded),
            (StageKind::Build, StageStatus::Succeeded),
            (StageKind::Test, StageStatus::Failed),
            (StageKind::Deploy, StageStatus::Skipped),
        ],
    );
    assert_eq!(run.stage(StageKind::Build).unwrap().output.trim(), "hi");
    assert_eq!(run.stage(StageKind::Test).unwrap().exit_code, Some(1));

    let listed = store.list_runs("stored", 10, 0).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, run_id);
}

/// The in-process database works for a whole run
#[tokio::test]
async fn test_memory_database_run() {
    let work = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteRunStore::new(":memory:").await.unwrap());
    let runner = PipelineRunner::with_checkout(
        store.clone(),
        &RunnerSettings::new(work.path()),
        LocalCheckout::default(),
    );

    let handle = runner
        .trigger(&app("mem", "true", "true", ""), None)
        .await
        .unwrap();
    let run_id = handle.id();
    assert_eq!(handle.wait().await, RunStatus::Succeeded);

    let run = store.get_run(run_id).await.unwrap().unwrap();
    assert_finished(&run, RunStatus::Succeeded);
    assert_eq!(run.stages.len(), 3);
}
