//! Pipeline runner - drives one run from trigger to terminal status

use crate::{
    core::{
        derive_run_status, Application, Run, RunId, RunStatus, RunnerSettings, StageKind,
        StageStatus, StageUpdate,
    },
    error::PipelineError,
    execution::{
        cancel::{cancel_pair, CancelSignal},
        checkout::{CheckoutError, GitCheckout, SourceCheckout},
        executor::{OutputBuffer, StageExecutor},
        gate::{AppReservation, ConcurrencyGate},
        tracker::{CancelRequest, RunTracker},
    },
    persistence::RunStore,
};
use chrono::Utc;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

/// Events that can occur during a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    RunQueued {
        run_id: RunId,
        app_id: String,
    },
    RunStarted {
        run_id: RunId,
        app_id: String,
    },
    StageStarted {
        run_id: RunId,
        stage: StageKind,
    },
    StageFinished {
        run_id: RunId,
        stage: StageKind,
        status: StageStatus,
        exit_code: Option<i32>,
    },
    RunFinished {
        run_id: RunId,
        app_id: String,
        status: RunStatus,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(RunEvent) + Send + Sync>;

#[derive(Clone, Default)]
struct EventBus {
    handlers: Arc<RwLock<Vec<EventHandler>>>,
}

impl EventBus {
    fn add(&self, handler: EventHandler) {
        match self.handlers.write() {
            Ok(mut handlers) => handlers.push(handler),
            Err(poisoned) => poisoned.into_inner().push(handler),
        }
    }

    /// Handlers run inline on the run's task; a panicking handler is logged and skipped
    fn emit(&self, event: RunEvent) {
        let handlers = match self.handlers.read() {
            Ok(handlers) => handlers.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for handler in handlers.iter() {
            if panic::catch_unwind(AssertUnwindSafe(|| handler(event.clone()))).is_err() {
                error!("Event handler panicked on {:?}", event);
            }
        }
    }
}

/// Stage output recorded when a run's task dies
fn describe_abort(e: JoinError) -> String {
    if !e.is_panic() {
        return format!("internal error: {}", e);
    }
    let payload = e.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "run task panicked".to_string());
    format!("internal error: {}", message)
}

/// A triggered run. Await it for the terminal status, or drop it to let the run
/// continue detached.
#[derive(Debug)]
pub struct RunHandle {
    run_id: RunId,
    task: JoinHandle<RunStatus>,
}

impl RunHandle {
    pub fn id(&self) -> RunId {
        self.run_id
    }

    /// Wait for the run to reach a terminal status
    pub async fn wait(self) -> RunStatus {
        match self.task.await {
            Ok(status) => status,
            Err(e) => {
                error!("Run {} task did not complete: {}", self.run_id, e);
                RunStatus::Failed
            }
        }
    }
}

/// Main pipeline runner
pub struct PipelineRunner<C = GitCheckout> {
    store: Arc<dyn RunStore>,
    gate: ConcurrencyGate,
    checkout: Arc<C>,
    executor: StageExecutor,
    work_dir: PathBuf,
    tracker: RunTracker,
    events: EventBus,
}

impl PipelineRunner<GitCheckout> {
    /// Runner that checks out sources with git
    pub fn new(store: Arc<dyn RunStore>, settings: &RunnerSettings) -> Self {
        let checkout = GitCheckout::new(settings.output_limit_bytes);
        Self::with_checkout(store, settings, checkout)
    }
}

impl<C: SourceCheckout> PipelineRunner<C> {
    pub fn with_checkout(store: Arc<dyn RunStore>, settings: &RunnerSettings, checkout: C) -> Self {
        Self {
            tracker: RunTracker::new(store.clone()),
            store,
            gate: ConcurrencyGate::new(settings.max_concurrent_runs),
            checkout: Arc::new(checkout),
            executor: StageExecutor::new(settings.output_limit_bytes),
            work_dir: settings.work_dir.clone(),
            events: EventBus::default(),
        }
    }

    /// Add an event handler
    pub fn add_event_handler<F>(&self, handler: F)
    where
        F: Fn(RunEvent) + Send + Sync + 'static,
    {
        self.events.add(Arc::new(handler));
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Working directory for an application
    pub fn work_dir_for(&self, app_id: &str) -> PathBuf {
        self.work_dir.join(app_id)
    }

    /// Whether this runner is still executing stages of the run
    pub fn is_active(&self, run_id: RunId) -> bool {
        self.tracker.is_running(run_id)
    }

    pub fn active_runs(&self) -> usize {
        self.tracker.running()
    }

    /// Start a run for `app` on its own task and return immediately.
    ///
    /// Fails with `Busy`, without creating a run, if the application already has an
    /// active run, and with `InvalidCommand` if a stage command cannot be tokenized. `triggered_by` is recorded on the run for auditing only.
    pub async fn trigger(
        &self,
        app: &Application,
        triggered_by: Option<&str>,
    ) -> Result<RunHandle, PipelineError> {
        for kind in app.stage_plan() {
            if kind != StageKind::Checkout && shlex::split(app.command(kind)).is_none() {
                return Err(PipelineError::InvalidCommand(format!(
                    "{} command of {}: {}",
                    kind,
                    app.id,
                    app.command(kind)
                )));
            }
        }

        let reservation = self.gate.reserve(&app.id).map_err(|_| {
            info!("Rejecting trigger for {}: a run is already active", app.id);
            PipelineError::Busy(app.id.clone())
        })?;

        let run_id = self
            .store
            .create_run(&app.id, triggered_by)
            .await
            .map_err(PipelineError::StoreUnavailable)?;

        let (cancel_handle, cancel_signal) = cancel_pair();
        self.tracker.track(run_id, cancel_handle);

        let task = RunTask {
            run_id,
            app: app.clone(),
            work_dir: self.work_dir_for(&app.id),
            checkout: self.checkout.clone(),
            executor: self.executor.clone(),
            tracker: self.tracker.clone(),
            events: self.events.clone(),
        };

        for kind in app.stage_plan() {
            task.persist(&StageUpdate::pending(kind)).await;
        }

        info!("Queued run {} for {}", run_id, app.id);
        self.events.emit(RunEvent::RunQueued {
            run_id,
            app_id: app.id.clone(),
        });

        let tracker = self.tracker.clone();
        let store = self.store.clone();
        let events = self.events.clone();
        let app_id = app.id.clone();
        let inner = tokio::spawn(async move { task.drive(reservation, cancel_signal).await });

        // The inner task owns the gate pass, so a panic still releases it while
        // unwinding; the run record is closed out here
        let task = tokio::spawn(async move {
            let reason = match inner.await {
                Ok(status) => return status,
                Err(e) => describe_abort(e),
            };
            error!("Run {} aborted: {}", run_id, reason);

            let status = match tracker.abandon(run_id, &reason).await {
                Some(Ok(status)) => status,
                Some(Err(e)) => {
                    warn!(
                        "Run {}: aborted run not recorded yet: {}",
                        run_id,
                        PipelineError::StoreUnavailable(e)
                    );
                    RunStatus::Failed
                }
                None => {
                    // The task had already closed the run
                    return match store.get_run(run_id).await {
                        Ok(Some(run)) if run.status.is_terminal() => run.status,
                        _ => RunStatus::Failed,
                    };
                }
            };
            events.emit(RunEvent::RunFinished {
                run_id,
                app_id,
                status,
            });
            status
        });

        Ok(RunHandle { run_id, task })
    }

    /// Cancel an active run.
    ///
    /// The run's task kills the running process, marks the current and remaining stages
    /// `cancelled`, finalizes the run and releases the gate. Cancelling a terminal run
    /// reports `AlreadyFinished` and changes nothing, and so does a request that lands
    /// after the run's last stage has finished. If the run's terminal status could not be
    /// written yet, the write is retried and its failure reported as `StoreUnavailable`.
    pub async fn cancel(&self, run_id: RunId) -> Result<(), PipelineError> {
        match self.tracker.request_cancel(run_id) {
            CancelRequest::Requested => {
                info!("Cancellation requested for run {}", run_id);
                return Ok(());
            }
            CancelRequest::AlreadyRequested => {
                debug!("Run {} was already being cancelled", run_id);
                return Ok(());
            }
            CancelRequest::Closing => {
                self.tracker.settle(run_id).await?;
                return Err(PipelineError::AlreadyFinished(run_id));
            }
            CancelRequest::Untracked => {}
        }

        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(PipelineError::RunNotFound(run_id))?;

        if run.status.is_terminal() {
            return Err(PipelineError::AlreadyFinished(run_id));
        }

        // Not driven by this runner, e.g. left behind by a previous process
        let mut statuses = Vec::with_capacity(run.stages.len());
        let mut open = 0;
        for stage in &run.stages {
            if stage.status.is_terminal() {
                statuses.push(stage.status);
                continue;
            }
            let mut update = StageUpdate::from(stage.clone());
            update.status = StageStatus::Cancelled;
            update.finished_at = Some(Utc::now());
            self.store.update_stage(run_id, &update).await?;
            statuses.push(StageStatus::Cancelled);
            open += 1;
        }

        let status = if run.stages.is_empty() {
            RunStatus::Cancelled
        } else {
            derive_run_status(statuses)
        };
        self.store.finalize_run(run_id, status).await?;

        if open == 0 && !run.stages.is_empty() {
            info!(
                "Run {} is not active here and every stage had finished, recorded as {}",
                run_id, status
            );
            return Err(PipelineError::AlreadyFinished(run_id));
        }
        warn!(
            "Run {} is not active here, cancelled {} open stage(s), recorded as {}",
            run_id, open, status
        );
        Ok(())
    }

    /// Load a run with its stages.
    ///
    /// Fails with `StoreUnavailable` while writes of the run this runner could not get
    /// into the store are still outstanding.
    pub async fn get_run(&self, run_id: RunId) -> Result<Run, PipelineError> {
        self.tracker.settle(run_id).await?;
        self.store
            .get_run(run_id)
            .await?
            .ok_or(PipelineError::RunNotFound(run_id))
    }

    /// Runs for one application, newest first
    pub async fn list_runs(
        &self,
        app_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Run>, PipelineError> {
        self.tracker.settle_all().await?;
        Ok(self.store.list_runs(app_id, limit, offset).await?)
    }
}

/// Everything one run's task needs
struct RunTask<C> {
    run_id: RunId,
    app: Application,
    work_dir: PathBuf,
    checkout: Arc<C>,
    executor: StageExecutor,
    tracker: RunTracker,
    events: EventBus,
}

impl<C: SourceCheckout> RunTask<C> {
    async fn drive(self, reservation: AppReservation, mut cancel: CancelSignal) -> RunStatus {
        let plan = self.app.stage_plan();

        // Wait for a global slot; the application stays reserved meanwhile
        let admitted = tokio::select! {
            pass = reservation.admit() => Some(pass),
            _ = cancel.cancelled() => None,
        };

        let pass = match admitted {
            Some(Ok(pass)) => pass,
            Some(Err(e)) => {
                error!("Run {} could not be admitted: {}", self.run_id, e);
                let mut statuses = Vec::new();
                for (idx, kind) in plan.iter().enumerate() {
                    let mut update = StageUpdate::not_run(*kind, StageStatus::Skipped);
                    if idx == 0 {
                        update.status = StageStatus::Failed;
                        update.output = e.to_string();
                    }
                    self.persist(&update).await;
                    statuses.push(update.status);
                }
                return self.finish(derive_run_status(statuses), &cancel).await;
            }
            None => {
                info!("Run {} cancelled while queued", self.run_id);
                for kind in &plan {
                    self.persist(&StageUpdate::not_run(*kind, StageStatus::Cancelled))
                        .await;
                }
                return self.finish(RunStatus::Cancelled, &cancel).await;
            }
        };

        if let Err(e) = self.tracker.mark_running(self.run_id).await {
            warn!("Run {}: {}", self.run_id, PipelineError::StoreUnavailable(e));
        }
        info!("Run {} started for {}", self.run_id, self.app.id);
        self.events.emit(RunEvent::RunStarted {
            run_id: self.run_id,
            app_id: self.app.id.clone(),
        });

        let mut statuses = Vec::with_capacity(plan.len());
        // Status given to every stage after the first one that did not succeed
        let mut halted: Option<StageStatus> = None;

        for kind in plan {
            if halted.is_none() && cancel.is_cancelled() {
                halted = Some(StageStatus::Cancelled);
            }
            if let Some(fill) = halted {
                let update = StageUpdate::not_run(kind, fill);
                self.persist(&update).await;
                self.stage_finished(&update);
                statuses.push(fill);
                continue;
            }

            let started_at = Utc::now();
            self.persist(&StageUpdate::running(kind, started_at)).await;
            self.events.emit(RunEvent::StageStarted {
                run_id: self.run_id,
                stage: kind,
            });

            let update = match kind {
                StageKind::Checkout => self.checkout_stage(started_at, &mut cancel).await,
                _ => {
                    self.executor
                        .execute(
                            kind,
                            &self.work_dir,
                            self.app.command(kind),
                            self.app.delay(kind),
                            &mut cancel,
                        )
                        .await
                }
            };

            self.persist(&update).await;
            self.stage_finished(&update);
            statuses.push(update.status);

            match update.status {
                StageStatus::Failed => {
                    if kind != StageKind::Checkout {
                        warn!(
                            "Run {}: {}",
                            self.run_id,
                            PipelineError::CommandFailed {
                                stage: kind,
                                exit_code: update.exit_code,
                            }
                        );
                    }
                    halted = Some(StageStatus::Skipped);
                }
                StageStatus::Cancelled => {
                    info!("Run {} cancelled during {}", self.run_id, kind);
                    halted = Some(StageStatus::Cancelled);
                }
                _ => {}
            }
        }

        let status = self.finish(derive_run_status(statuses), &cancel).await;
        pass.release();
        status
    }

    async fn checkout_stage(
        &self,
        started_at: chrono::DateTime<Utc>,
        cancel: &mut CancelSignal,
    ) -> StageUpdate {
        let result = self.checkout.sync(&self.app, &self.work_dir, cancel).await;

        let (status, exit_code, output) = match result {
            Ok(output) => (StageStatus::Succeeded, Some(0), output),
            Err(CheckoutError::Cancelled { output }) => (StageStatus::Cancelled, None, output),
            Err(e) => {
                warn!(
                    "Run {}: {}",
                    self.run_id,
                    PipelineError::CheckoutFailed(e.to_string())
                );
                (StageStatus::Failed, e.exit_code(), e.output().to_string())
            }
        };

        let mut buffer = OutputBuffer::new(self.executor.output_limit());
        buffer.push(output.as_bytes());

        StageUpdate {
            kind: StageKind::Checkout,
            status,
            started_at: Some(started_at),
            finished_at: Some(Utc::now()),
            exit_code,
            output: buffer.render(),
        }
    }

    fn stage_finished(&self, update: &StageUpdate) {
        self.events.emit(RunEvent::StageFinished {
            run_id: self.run_id,
            stage: update.kind,
            status: update.status,
            exit_code: update.exit_code,
        });
    }

    /// Write a stage, logging instead of failing when the store is unavailable
    async fn persist(&self, update: &StageUpdate) {
        if let Err(e) = self.tracker.record(self.run_id, update).await {
            warn!(
                "Run {}: could not record {} as {}: {}",
                self.run_id,
                update.kind,
                update.status,
                PipelineError::StoreUnavailable(e)
            );
        }
    }

    /// Finalize the run record; from here on cancellation is refused
    async fn finish(&self, status: RunStatus, cancel: &CancelSignal) -> RunStatus {
        if let Err(e) = self.tracker.close(self.run_id, status).await {
            warn!(
                "Run {}: could not finalize as {}, retrying on the next read: {}",
                self.run_id,
                status,
                PipelineError::StoreUnavailable(e)
            );
        }
        if cancel.is_cancelled() && status != RunStatus::Cancelled {
            debug!(
                "Run {} ended {} before its cancellation took effect",
                self.run_id, status
            );
        }

        info!("Run {} for {} finished: {}", self.run_id, self.app.id, status);
        self.events.emit(RunEvent::RunFinished {
            run_id: self.run_id,
            app_id: self.app.id.clone(),
            status,
        });
        status
    }
}

impl<C> std::fmt::Debug for PipelineRunner<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRunner")
            .field("work_dir", &self.work_dir)
            .field("max_concurrent", &self.gate.max_concurrent())
            .field("active_runs", &self.tracker.running())
            .finish()
    }
}
