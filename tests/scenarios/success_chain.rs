//! Test: Success Chain - every stage runs in order and succeeds

use crate::helpers::*;
use piaflow::core::{RunStatus, StageKind, StageStatus};
use std::time::Duration;

/// Full pipeline with a deploy command
#[tokio::test]
async fn test_full_pipeline_with_deploy() {
    let yaml = r#"
apps:
  - id: web
    name: Web Frontend
    repo: https://example.com/web.git
    build_cmd: echo building
    test_cmd: echo "testing all"
    deploy_cmd: echo deploying
"#;
    let bed = TestBed::new();
    let run = bed.run_to_end(&app_from_yaml(yaml)).await;

    assert_finished(&run, RunStatus::Succeeded);
    assert_stages(
        &run,
        &[
            (StageKind::Checkout, StageStatus::Succeeded),
            (StageKind::Build, StageStatus::Succeeded),
            (StageKind::Test, StageStatus::Succeeded),
            (StageKind::Deploy, StageStatus::Succeeded),
        ],
    );

    assert!(run.stage(StageKind::Checkout).unwrap().output.contains("prepared"));
    let build = run.stage(StageKind::Build).unwrap();
    assert_eq!(build.exit_code, Some(0));
    assert_eq!(build.output.trim(), "building");
    assert_eq!(run.stage(StageKind::Test).unwrap().output.trim(), "testing all");
    assert_eq!(run.stage(StageKind::Deploy).unwrap().output.trim(), "deploying");
    assert!(run.started_at.is_some());
}

/// No deploy command means no deploy stage at all
#[tokio::test]
async fn test_no_deploy_stage_without_command() {
    let bed = TestBed::new();
    let run = bed.run_to_end(&app("api", "true", "true", "")).await;

    assert_finished(&run, RunStatus::Succeeded);
    assert_eq!(
        run.stage_kinds(),
        vec![StageKind::Checkout, StageKind::Build, StageKind::Test]
    );
    assert!(run.stage(StageKind::Deploy).is_none());
}

/// Commands run inside the application's working directory
#[tokio::test]
async fn test_stages_share_working_directory() {
    let bed = TestBed::new();
    let run = bed
        .run_to_end(&app("files", "touch built.txt", "ls built.txt", ""))
        .await;

    assert_finished(&run, RunStatus::Succeeded);
    assert!(bed.work.path().join("files").join("built.txt").exists());
    assert!(run.stage(StageKind::Test).unwrap().output.contains("built.txt"));
}

/// Arguments are passed through without a shell
#[tokio::test]
async fn test_arguments_not_reinterpreted() {
    let bed = TestBed::new();
    let run = bed
        .run_to_end(&app("literal", "echo $HOME; echo done", "true", ""))
        .await;

    assert_finished(&run, RunStatus::Succeeded);
    assert_eq!(
        run.stage(StageKind::Build).unwrap().output.trim(),
        "$HOME; echo done"
    );
}

/// A configured pause makes the stage last at least that long
#[tokio::test]
async fn test_stage_delay_counts_toward_duration() {
    let mut slow = app("slow", "true", "true", "");
    slow.build_sleep_sec = 1;

    let bed = TestBed::new();
    let run = bed.run_to_end(&slow).await;

    assert_finished(&run, RunStatus::Succeeded);
    let build = run.stage(StageKind::Build).unwrap();
    let duration = build.duration().unwrap().to_std().unwrap();
    assert!(duration >= Duration::from_secs(1), "build took {:?}", duration);

    let test = run.stage(StageKind::Test).unwrap();
    assert!(test.started_at.unwrap() >= build.finished_at.unwrap());
}

/// Each run re-syncs the working directory
#[tokio::test]
async fn test_checkout_runs_every_time() {
    let bed = TestBed::new();
    let app = app("again", "true", "true", "");

    bed.run_to_end(&app).await;
    bed.run_to_end(&app).await;

    assert_eq!(bed.checkout_count(), 2);
}
