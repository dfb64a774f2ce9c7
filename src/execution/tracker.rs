//! Bookkeeping for the runs a runner is driving
//!
//! A run's task records every stage here before writing it to the store. Writes the
//! store rejects stay queued on the run's entry and are replayed when the run closes,
//! or on the next read of the run if the store is still unavailable by then. An entry
//! only goes away once the store holds the run's terminal status.

use crate::{
    core::{derive_run_status, RunId, RunStatus, StageKind, StageStatus, StageUpdate},
    execution::cancel::CancelHandle,
    persistence::{RunStore, StoreError},
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// Attempts made to write a closing run before leaving it for the next read
const CLOSE_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

struct Entry {
    cancel: CancelHandle,
    /// Latest state of every stage, whether or not the store has it
    stages: Vec<StageUpdate>,
    /// Stages whose latest state the store is missing
    unsaved: Vec<StageKind>,
    start_unsaved: bool,
    /// Terminal status once every stage is done
    closing: Option<RunStatus>,
}

impl Entry {
    fn remember(&mut self, update: &StageUpdate) {
        match self.stages.iter_mut().find(|s| s.kind == update.kind) {
            Some(stage) => *stage = update.clone(),
            None => {
                self.stages.push(update.clone());
                self.stages.sort_by_key(|s| s.kind.position());
            }
        }
    }

    fn saved(&mut self, kind: StageKind) {
        self.unsaved.retain(|k| *k != kind);
    }

    fn lost(&mut self, kind: StageKind) {
        if !self.unsaved.contains(&kind) {
            self.unsaved.push(kind);
        }
    }

    fn backlog(&self) -> Vec<StageUpdate> {
        self.stages
            .iter()
            .filter(|s| self.unsaved.contains(&s.kind))
            .cloned()
            .collect()
    }
}

/// Where a cancellation request landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelRequest {
    Requested,
    AlreadyRequested,
    /// Every stage is done and only the terminal status is outstanding
    Closing,
    Untracked,
}

#[derive(Clone)]
pub(crate) struct RunTracker {
    store: Arc<dyn RunStore>,
    runs: Arc<Mutex<HashMap<RunId, Entry>>>,
}

impl RunTracker {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self {
            store,
            runs: Arc::default(),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut HashMap<RunId, Entry>) -> T) -> T {
        match self.runs.lock() {
            Ok(mut runs) => f(&mut runs),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    fn with_entry(&self, run_id: RunId, f: impl FnOnce(&mut Entry)) {
        self.with(|runs| {
            if let Some(entry) = runs.get_mut(&run_id) {
                f(entry)
            }
        })
    }

    pub fn track(&self, run_id: RunId, cancel: CancelHandle) {
        self.with(|runs| {
            runs.insert(
                run_id,
                Entry {
                    cancel,
                    stages: Vec::new(),
                    unsaved: Vec::new(),
                    start_unsaved: false,
                    closing: None,
                },
            )
        });
    }

    /// Whether the run still has stages to execute
    pub fn is_running(&self, run_id: RunId) -> bool {
        self.with(|runs| runs.get(&run_id).is_some_and(|e| e.closing.is_none()))
    }

    pub fn running(&self) -> usize {
        self.with(|runs| runs.values().filter(|e| e.closing.is_none()).count())
    }

    /// Runs whose terminal status the store does not have yet
    pub fn closing(&self) -> Vec<RunId> {
        let mut ids: Vec<RunId> = self.with(|runs| {
            runs.iter()
                .filter(|(_, e)| e.closing.is_some())
                .map(|(id, _)| *id)
                .collect()
        });
        ids.sort_unstable();
        ids
    }

    /// Signal the run's task, unless its stages are already done
    pub fn request_cancel(&self, run_id: RunId) -> CancelRequest {
        self.with(|runs| match runs.get(&run_id) {
            None => CancelRequest::Untracked,
            Some(entry) if entry.closing.is_some() => CancelRequest::Closing,
            Some(entry) => {
                if entry.cancel.cancel() {
                    CancelRequest::Requested
                } else {
                    CancelRequest::AlreadyRequested
                }
            }
        })
    }

    /// Remember a stage and write it to the store
    pub async fn record(&self, run_id: RunId, update: &StageUpdate) -> Result<(), StoreError> {
        self.with_entry(run_id, |entry| entry.remember(update));
        let result = self.store.update_stage(run_id, update).await;
        let written = result.is_ok();
        self.with_entry(run_id, |entry| {
            if written {
                entry.saved(update.kind)
            } else {
                entry.lost(update.kind)
            }
        });
        result
    }

    pub async fn mark_running(&self, run_id: RunId) -> Result<(), StoreError> {
        let result = self.store.mark_running(run_id).await;
        if result.is_err() {
            self.with_entry(run_id, |entry| entry.start_unsaved = true);
        }
        result
    }

    /// Stop accepting cancellation and write the terminal status.
    ///
    /// On failure the run stays tracked and the write is retried on the next read.
    pub async fn close(&self, run_id: RunId, status: RunStatus) -> Result<(), StoreError> {
        self.with_entry(run_id, |entry| entry.closing = Some(status));

        let mut attempt = 1;
        loop {
            match self.settle(run_id).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= CLOSE_ATTEMPTS => return Err(e),
                Err(e) => {
                    debug!("Run {}: close attempt {} failed: {}", run_id, attempt, e);
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Close a run whose task died.
    ///
    /// The first open stage fails with `reason` and later open stages are skipped.
    /// Returns `None` if the run was not tracked.
    pub async fn abandon(
        &self,
        run_id: RunId,
        reason: &str,
    ) -> Option<Result<RunStatus, StoreError>> {
        let status = self.with(|runs| {
            let entry = runs.get_mut(&run_id)?;
            let now = Utc::now();
            let mut fill = StageStatus::Failed;
            let mut closed = Vec::new();
            for stage in entry.stages.iter_mut().filter(|s| !s.status.is_terminal()) {
                stage.status = fill;
                stage.finished_at = Some(now);
                if fill == StageStatus::Failed {
                    stage.output = reason.to_string();
                    fill = StageStatus::Skipped;
                }
                closed.push(stage.kind);
            }
            for kind in closed {
                entry.lost(kind);
            }
            let status = if entry.stages.is_empty() {
                RunStatus::Failed
            } else {
                derive_run_status(entry.stages.iter().map(|s| s.status))
            };
            entry.closing = Some(status);
            Some(status)
        })?;

        Some(self.close(run_id, status).await.map(|()| status))
    }

    /// Replay what the store is missing for a closing run, then finalize it.
    ///
    /// Running and untracked runs are left alone.
    pub async fn settle(&self, run_id: RunId) -> Result<(), StoreError> {
        let pending = self.with(|runs| {
            let entry = runs.get(&run_id)?;
            entry
                .closing
                .map(|status| (status, entry.start_unsaved, entry.backlog()))
        });
        let Some((status, start_unsaved, backlog)) = pending else {
            return Ok(());
        };

        if start_unsaved {
            match self.store.mark_running(run_id).await {
                Ok(()) | Err(StoreError::AlreadyFinished(_)) => {
                    self.with_entry(run_id, |entry| entry.start_unsaved = false)
                }
                Err(e) => return Err(e),
            }
        }

        for update in &backlog {
            self.store.update_stage(run_id, update).await?;
            self.with_entry(run_id, |entry| entry.saved(update.kind));
        }

        match self.store.finalize_run(run_id, status).await {
            Ok(()) => {
                if !backlog.is_empty() || start_unsaved {
                    info!("Run {}: recovered {} lost write(s)", run_id, backlog.len());
                }
            }
            Err(StoreError::AlreadyFinished(_)) => debug!("Run {} was already finalized", run_id),
            Err(e) => return Err(e),
        }

        self.with(|runs| runs.remove(&run_id));
        Ok(())
    }

    /// Settle every closing run, stopping at the first failure
    pub async fn settle_all(&self) -> Result<(), StoreError> {
        for run_id in self.closing() {
            self.settle(run_id).await?;
        }
        Ok(())
    }
}
