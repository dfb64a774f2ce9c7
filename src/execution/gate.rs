//! Concurrency gate - one active run per application, bounded runs overall

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateError {
    /// Another run holds this application's working directory
    #[error("application '{0}' is busy")]
    Busy(String),

    #[error("concurrency gate is closed")]
    Closed,
}

/// Per-application lock table plus a global semaphore.
///
/// Application locks are created lazily and never removed; the table is bounded by the
/// number of configured applications.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
    slots: Arc<Semaphore>,
    max_concurrent: usize,
}

impl ConcurrencyGate {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
            slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    fn app_lock(&self, app_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(app_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Claim the application's lock without waiting.
    ///
    /// Fails with `Busy` if another run for the application holds it.
    pub fn reserve(&self, app_id: &str) -> Result<AppReservation, GateError> {
        let guard = self
            .app_lock(app_id)
            .try_lock_owned()
            .map_err(|_| GateError::Busy(app_id.to_string()))?;

        debug!("Reserved application {}", app_id);
        Ok(AppReservation {
            app_id: app_id.to_string(),
            guard,
            slots: self.slots.clone(),
        })
    }

    /// Claim the application's lock (failing fast when busy), then wait for a global slot
    pub async fn acquire(&self, app_id: &str) -> Result<GatePass, GateError> {
        self.reserve(app_id)?.admit().await
    }

    /// Whether a run for the application currently holds its lock
    pub fn is_busy(&self, app_id: &str) -> bool {
        self.app_lock(app_id).try_lock().is_err()
    }

    /// Global slots not currently in use
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }
}

/// Exclusive claim on one application's working directory, not yet holding a global slot
#[derive(Debug)]
pub struct AppReservation {
    app_id: String,
    guard: OwnedMutexGuard<()>,
    slots: Arc<Semaphore>,
}

impl AppReservation {
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Wait for a global slot. The application lock is kept while waiting.
    pub async fn admit(self) -> Result<GatePass, GateError> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| GateError::Closed)?;

        debug!("Admitted application {}", self.app_id);
        Ok(GatePass {
            app_id: self.app_id,
            _guard: self.guard,
            _permit: permit,
        })
    }
}

/// Full execution rights: the application lock and a global slot.
///
/// Both are released exactly once, when the pass is released or dropped.
#[derive(Debug)]
pub struct GatePass {
    app_id: String,
    _guard: OwnedMutexGuard<()>,
    _permit: OwnedSemaphorePermit,
}

impl GatePass {
    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Release the application lock and the global slot
    pub fn release(self) {}
}

impl Drop for GatePass {
    fn drop(&mut self) {
        debug!("Released application {}", self.app_id);
    }
}
