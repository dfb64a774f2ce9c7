//! Persistence layer for runs, stages and access-control records

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteRunStore;

use crate::core::{Run, RunId, RunStatus, Stage, StageKind, StageUpdate};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("run {0} is already finished")]
    AlreadyFinished(RunId),

    #[error("run {0} not found")]
    NotFound(RunId),

    #[error("conflict: {0}")]
    Conflict(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Durable record of runs and their stages
#[async_trait::async_trait]
pub trait RunStore: Send + Sync {
    /// Allocate a new run in `pending`
    async fn create_run(&self, app_id: &str, triggered_by: Option<&str>) -> StoreResult<RunId>;

    /// Move a pending run to `running` and stamp its start time
    async fn mark_running(&self, run_id: RunId) -> StoreResult<()>;

    /// Upsert one stage; readers never see a partially written stage
    async fn update_stage(&self, run_id: RunId, update: &StageUpdate) -> StoreResult<()>;

    /// Set the terminal status and finished-at time.
    ///
    /// Fails with `AlreadyFinished` if the run is already terminal.
    async fn finalize_run(&self, run_id: RunId, status: RunStatus) -> StoreResult<()>;

    /// Load a run with its stages in execution order
    async fn get_run(&self, run_id: RunId) -> StoreResult<Option<Run>>;

    /// Runs for one application, newest first
    async fn list_runs(&self, app_id: &str, limit: usize, offset: usize) -> StoreResult<Vec<Run>>;
}

/// A user group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
}

/// A user account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
}

/// Group, user and application-group records sharing the run store's persistence
#[async_trait::async_trait]
pub trait AccessStore: Send + Sync {
    async fn list_groups(&self) -> StoreResult<Vec<Group>>;

    async fn create_group(&self, name: &str) -> StoreResult<i64>;

    async fn list_users(&self) -> StoreResult<Vec<User>>;

    async fn create_user(&self, username: &str, password_hash: &str) -> StoreResult<i64>;

    async fn find_user(&self, username: &str) -> StoreResult<Option<User>>;

    async fn update_password_hash(&self, user_id: i64, password_hash: &str) -> StoreResult<()>;

    /// Replace the groups a user belongs to
    async fn set_user_groups(&self, user_id: i64, group_ids: &[i64]) -> StoreResult<()>;

    async fn app_group_ids(&self, app_id: &str) -> StoreResult<Vec<i64>>;

    /// Replace the groups an application belongs to
    async fn set_app_groups(&self, app_id: &str, group_ids: &[i64]) -> StoreResult<()>;
}

#[derive(Default)]
struct MemoryState {
    next_run_id: RunId,
    runs: BTreeMap<RunId, Run>,
    groups: Vec<Group>,
    users: Vec<User>,
    user_groups: HashMap<i64, Vec<i64>>,
    app_groups: HashMap<String, Vec<i64>>,
}

/// In-memory store (for testing or ephemeral use)
pub struct InMemoryRunStore {
    state: tokio::sync::RwLock<MemoryState>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self {
            state: tokio::sync::RwLock::new(MemoryState::default()),
        }
    }
}

impl Default for InMemoryRunStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl RunStore for InMemoryRunStore {
    async fn create_run(&self, app_id: &str, triggered_by: Option<&str>) -> StoreResult<RunId> {
        let mut state = self.state.write().await;
        state.next_run_id += 1;
        let id = state.next_run_id;
        state.runs.insert(
            id,
            Run {
                id,
                app_id: app_id.to_string(),
                status: RunStatus::Pending,
                triggered_by: triggered_by.map(str::to_string),
                created_at: Utc::now(),
                started_at: None,
                finished_at: None,
                stages: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn mark_running(&self, run_id: RunId) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let run = state.runs.get_mut(&run_id).ok_or(StoreError::NotFound(run_id))?;
        if run.status.is_terminal() {
            return Err(StoreError::AlreadyFinished(run_id));
        }
        run.status = RunStatus::Running;
        run.started_at.get_or_insert_with(Utc::now);
        Ok(())
    }

    async fn update_stage(&self, run_id: RunId, update: &StageUpdate) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let run = state.runs.get_mut(&run_id).ok_or(StoreError::NotFound(run_id))?;
        let stage = update.clone().into_stage();
        match run.stages.iter_mut().find(|s| s.kind == update.kind) {
            Some(existing) => *existing = stage,
            None => {
                run.stages.push(stage);
                run.stages.sort_by_key(|s: &Stage| s.kind.position());
            }
        }
        Ok(())
    }

    async fn finalize_run(&self, run_id: RunId, status: RunStatus) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let run = state.runs.get_mut(&run_id).ok_or(StoreError::NotFound(run_id))?;
        if run.status.is_terminal() {
            return Err(StoreError::AlreadyFinished(run_id));
        }
        run.status = status;
        run.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn get_run(&self, run_id: RunId) -> StoreResult<Option<Run>> {
        let state = self.state.read().await;
        Ok(state.runs.get(&run_id).cloned())
    }

    async fn list_runs(&self, app_id: &str, limit: usize, offset: usize) -> StoreResult<Vec<Run>> {
        let state = self.state.read().await;
        // Ids are allocated in creation order, so reverse id order is newest first
        Ok(state
            .runs
            .values()
            .rev()
            .filter(|r| r.app_id == app_id)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait::async_trait]
impl AccessStore for InMemoryRunStore {
    async fn list_groups(&self) -> StoreResult<Vec<Group>> {
        Ok(self.state.read().await.groups.clone())
    }

    async fn create_group(&self, name: &str) -> StoreResult<i64> {
        let mut state = self.state.write().await;
        if state.groups.iter().any(|g| g.name == name) {
            return Err(StoreError::Conflict(format!("group '{}' already exists", name)));
        }
        let id = state.groups.len() as i64 + 1;
        state.groups.push(Group {
            id,
            name: name.to_string(),
        });
        Ok(id)
    }

    async fn list_users(&self) -> StoreResult<Vec<User>> {
        Ok(self.state.read().await.users.clone())
    }

    async fn create_user(&self, username: &str, password_hash: &str) -> StoreResult<i64> {
        let mut state = self.state.write().await;
        if state.users.iter().any(|u| u.username == username) {
            return Err(StoreError::Conflict(format!(
                "user '{}' already exists",
                username
            )));
        }
        let id = state.users.len() as i64 + 1;
        state.users.push(User {
            id,
            username: username.to_string(),
            password_hash: password_hash.to_string(),
        });
        Ok(id)
    }

    async fn find_user(&self, username: &str) -> StoreResult<Option<User>> {
        let state = self.state.read().await;
        Ok(state.users.iter().find(|u| u.username == username).cloned())
    }

    async fn update_password_hash(&self, user_id: i64, password_hash: &str) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .iter_mut()
            .find(|u| u.id == user_id)
            .ok_or_else(|| StoreError::Conflict(format!("user {} not found", user_id)))?;
        user.password_hash = password_hash.to_string();
        Ok(())
    }

    async fn set_user_groups(&self, user_id: i64, group_ids: &[i64]) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.user_groups.insert(user_id, group_ids.to_vec());
        Ok(())
    }

    async fn app_group_ids(&self, app_id: &str) -> StoreResult<Vec<i64>> {
        let state = self.state.read().await;
        Ok(state.app_groups.get(app_id).cloned().unwrap_or_default())
    }

    async fn set_app_groups(&self, app_id: &str, group_ids: &[i64]) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state.app_groups.insert(app_id.to_string(), group_ids.to_vec());
        Ok(())
    }
}
