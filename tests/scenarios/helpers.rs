//! Test utility functions for piaflow scenarios

use async_trait::async_trait;
use piaflow::core::{
    Application, AppsConfig, Run, RunId, RunStatus, RunnerSettings, StageKind, StageStatus,
    StageUpdate,
};
use piaflow::execution::{CancelSignal, CheckoutError, PipelineRunner, SourceCheckout};
use piaflow::persistence::{InMemoryRunStore, RunStore, StoreError, StoreResult};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Checkout that only prepares the working directory
#[derive(Default)]
pub struct LocalCheckout {
    pub syncs: Arc<AtomicUsize>,
}

#[async_trait]
impl SourceCheckout for LocalCheckout {
    async fn sync(
        &self,
        _app: &Application,
        work_dir: &Path,
        _cancel: &mut CancelSignal,
    ) -> Result<String, CheckoutError> {
        std::fs::create_dir_all(work_dir).map_err(|e| CheckoutError::Spawn(e.to_string()))?;
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(format!("prepared {}\n", work_dir.display()))
    }
}

/// Checkout that never finishes on its own, like a clone of an unreachable remote
pub struct StalledCheckout;

#[async_trait]
impl SourceCheckout for StalledCheckout {
    async fn sync(
        &self,
        _app: &Application,
        _work_dir: &Path,
        cancel: &mut CancelSignal,
    ) -> Result<String, CheckoutError> {
        cancel.cancelled().await;
        Err(CheckoutError::Cancelled {
            output: "Cloning into 'src'...\n".to_string(),
        })
    }
}

/// Store operations [`FlakyStore`] can be told to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    MarkRunning,
    UpdateStage,
    FinalizeRun,
}

/// In-memory store whose writes fail on demand
pub struct FlakyStore {
    inner: Arc<InMemoryRunStore>,
    failures: Mutex<HashMap<StoreOp, usize>>,
    finalize_delay: Mutex<Option<Duration>>,
}

impl FlakyStore {
    pub fn new(inner: Arc<InMemoryRunStore>) -> Self {
        Self {
            inner,
            failures: Mutex::new(HashMap::new()),
            finalize_delay: Mutex::new(None),
        }
    }

    /// Fail the next `times` calls of `op`
    pub fn fail(&self, op: StoreOp, times: usize) {
        self.failures.lock().unwrap().insert(op, times);
    }

    /// Fail every call of `op` until [`FlakyStore::heal`]
    pub fn fail_always(&self, op: StoreOp) {
        self.fail(op, usize::MAX);
    }

    pub fn heal(&self) {
        self.failures.lock().unwrap().clear();
    }

    /// Hold the next `finalize_run` call for `delay` before it goes through
    pub fn delay_next_finalize(&self, delay: Duration) {
        *self.finalize_delay.lock().unwrap() = Some(delay);
    }

    fn check(&self, op: StoreOp) -> StoreResult<()> {
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(&op) {
            Some(left) if *left > 0 => {
                if *left != usize::MAX {
                    *left -= 1;
                }
                Err(StoreError::Unavailable(format!("{:?}: database is locked", op)))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl RunStore for FlakyStore {
    async fn create_run(&self, app_id: &str, triggered_by: Option<&str>) -> StoreResult<RunId> {
        self.inner.create_run(app_id, triggered_by).await
    }

    async fn mark_running(&self, run_id: RunId) -> StoreResult<()> {
        self.check(StoreOp::MarkRunning)?;
        self.inner.mark_running(run_id).await
    }

    async fn update_stage(&self, run_id: RunId, update: &StageUpdate) -> StoreResult<()> {
        self.check(StoreOp::UpdateStage)?;
        self.inner.update_stage(run_id, update).await
    }

    async fn finalize_run(&self, run_id: RunId, status: RunStatus) -> StoreResult<()> {
        let delay = self.finalize_delay.lock().unwrap().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check(StoreOp::FinalizeRun)?;
        self.inner.finalize_run(run_id, status).await
    }

    async fn get_run(&self, run_id: RunId) -> StoreResult<Option<Run>> {
        self.inner.get_run(run_id).await
    }

    async fn list_runs(&self, app_id: &str, limit: usize, offset: usize) -> StoreResult<Vec<Run>> {
        self.inner.list_runs(app_id, limit, offset).await
    }
}

/// A runner over an in-memory store and a scratch work root.
///
/// `store` is the backing in-memory store, read directly to see what was recorded.
pub struct TestBed<C = LocalCheckout> {
    pub runner: PipelineRunner<C>,
    pub store: Arc<InMemoryRunStore>,
    pub work: TempDir,
    syncs: Arc<AtomicUsize>,
}

impl TestBed<LocalCheckout> {
    pub fn new() -> Self {
        Self::with_max_concurrent(4)
    }

    pub fn with_max_concurrent(max: usize) -> Self {
        let store = Arc::new(InMemoryRunStore::new());
        let checkout = LocalCheckout::default();
        let syncs = checkout.syncs.clone();
        Self::build(store.clone(), store, checkout, max, syncs)
    }

    /// A bed whose runner writes through a [`FlakyStore`]
    pub fn flaky() -> (Self, Arc<FlakyStore>) {
        let store = Arc::new(InMemoryRunStore::new());
        let flaky = Arc::new(FlakyStore::new(store.clone()));
        let checkout = LocalCheckout::default();
        let syncs = checkout.syncs.clone();
        let bed = Self::build(flaky.clone(), store, checkout, 4, syncs);
        (bed, flaky)
    }

    /// Number of completed checkouts
    pub fn checkout_count(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }
}

impl<C: SourceCheckout> TestBed<C> {
    pub fn with_checkout(checkout: C) -> Self {
        let store = Arc::new(InMemoryRunStore::new());
        Self::build(store.clone(), store, checkout, 4, Arc::default())
    }

    fn build(
        runner_store: Arc<dyn RunStore>,
        store: Arc<InMemoryRunStore>,
        checkout: C,
        max: usize,
        syncs: Arc<AtomicUsize>,
    ) -> Self {
        let work = tempfile::tempdir().unwrap();
        let settings = RunnerSettings::new(work.path()).with_max_concurrent_runs(max);
        let runner = PipelineRunner::with_checkout(runner_store, &settings, checkout);
        Self {
            runner,
            store,
            work,
            syncs,
        }
    }

    /// Trigger and wait for the recorded run
    pub async fn run_to_end(&self, app: &Application) -> Run {
        let handle = self.runner.trigger(app, None).await.unwrap();
        let run_id = handle.id();
        tokio::time::timeout(Duration::from_secs(30), handle.wait())
            .await
            .expect("run did not finish in time");
        self.store.get_run(run_id).await.unwrap().unwrap()
    }

    /// Poll until a stage of the run reaches `status`
    pub async fn wait_for_stage(&self, run_id: RunId, kind: StageKind, status: StageStatus) {
        for _ in 0..200 {
            if let Some(run) = self.store.get_run(run_id).await.unwrap() {
                if run.stage(kind).map(|s| s.status) == Some(status) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("stage {} of run {} never reached {}", kind, run_id, status);
    }
}

/// Parse a single application from YAML list-entry fields
pub fn app_from_yaml(yaml: &str) -> Application {
    let config = AppsConfig::from_yaml(yaml).unwrap();
    config.apps.into_iter().next().unwrap()
}

/// Build an application directly
pub fn app(id: &str, build: &str, test: &str, deploy: &str) -> Application {
    Application {
        id: id.to_string(),
        name: id.to_string(),
        repo: format!("https://example.com/{}.git", id),
        branch: String::new(),
        build_cmd: build.to_string(),
        test_cmd: test.to_string(),
        deploy_cmd: deploy.to_string(),
        build_sleep_sec: 0,
        test_sleep_sec: 0,
        deploy_sleep_sec: 0,
    }
}

/// Assert the run's stages, in order, with their statuses
pub fn assert_stages(run: &Run, expected: &[(StageKind, StageStatus)]) {
    let actual: Vec<(StageKind, StageStatus)> =
        run.stages.iter().map(|s| (s.kind, s.status)).collect();
    assert_eq!(actual, expected, "stages of run {}", run.id);
}

/// Assert a terminal run with consistent timestamps
pub fn assert_finished(run: &Run, status: RunStatus) {
    assert_eq!(run.status, status, "status of run {}", run.id);
    let finished = run.finished_at.expect("finished run has no finished_at");
    assert!(finished >= run.created_at);
    for stage in &run.stages {
        assert!(stage.status.is_terminal(), "stage {} not terminal", stage.kind);
        if let (Some(start), Some(end)) = (stage.started_at, stage.finished_at) {
            assert!(end >= start, "stage {} ends before it starts", stage.kind);
        }
    }
}
