//! Run and stage records

use crate::core::state::{RunStatus, StageKind, StageStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned run identifier, monotonically increasing
pub type RunId = i64;

/// One execution of an application's pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,

    /// Application the run belongs to
    pub app_id: String,

    pub status: RunStatus,

    /// Verified identity of whoever triggered the run (audit only)
    pub triggered_by: Option<String>,

    pub created_at: DateTime<Utc>,

    /// When the checkout stage started
    pub started_at: Option<DateTime<Utc>>,

    pub finished_at: Option<DateTime<Utc>>,

    /// Stages in execution order
    pub stages: Vec<Stage>,
}

impl Run {
    /// Look up a stage by kind
    pub fn stage(&self, kind: StageKind) -> Option<&Stage> {
        self.stages.iter().find(|s| s.kind == kind)
    }

    /// Kinds of the recorded stages, in order
    pub fn stage_kinds(&self) -> Vec<StageKind> {
        self.stages.iter().map(|s| s.kind).collect()
    }

    /// Status implied by the stages' terminal statuses
    pub fn derived_status(&self) -> RunStatus {
        derive_run_status(self.stages.iter().map(|s| s.status))
    }
}

/// One step of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub kind: StageKind,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    /// Combined stdout/stderr, bounded
    pub output: String,
}

impl Stage {
    pub fn pending(kind: StageKind) -> Self {
        Self {
            kind,
            status: StageStatus::Pending,
            started_at: None,
            finished_at: None,
            exit_code: None,
            output: String::new(),
        }
    }

    /// Wall-clock duration, if the stage ran
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end.signed_duration_since(start)),
            _ => None,
        }
    }
}

/// A stage write: the full set of fields that `update_stage` upserts
#[derive(Debug, Clone)]
pub struct StageUpdate {
    pub kind: StageKind,
    pub status: StageStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub output: String,
}

impl StageUpdate {
    pub fn pending(kind: StageKind) -> Self {
        Self::from(Stage::pending(kind))
    }

    pub fn running(kind: StageKind, started_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            status: StageStatus::Running,
            started_at: Some(started_at),
            finished_at: None,
            exit_code: None,
            output: String::new(),
        }
    }

    /// A stage that never ran and ends in `status` (skipped or cancelled)
    pub fn not_run(kind: StageKind, status: StageStatus) -> Self {
        Self {
            kind,
            status,
            started_at: None,
            finished_at: Some(Utc::now()),
            exit_code: None,
            output: String::new(),
        }
    }

    pub fn into_stage(self) -> Stage {
        Stage {
            kind: self.kind,
            status: self.status,
            started_at: self.started_at,
            finished_at: self.finished_at,
            exit_code: self.exit_code,
            output: self.output,
        }
    }
}

impl From<Stage> for StageUpdate {
    fn from(stage: Stage) -> Self {
        Self {
            kind: stage.kind,
            status: stage.status,
            started_at: stage.started_at,
            finished_at: stage.finished_at,
            exit_code: stage.exit_code,
            output: stage.output,
        }
    }
}

/// Derive a run's overall status from its stage statuses.
///
/// `failed` wins over `cancelled`, which wins over success. A run whose stages are
/// not all terminal is still `running` (or `pending` if nothing has started).
pub fn derive_run_status<I>(statuses: I) -> RunStatus
where
    I: IntoIterator<Item = StageStatus>,
{
    let mut any_failed = false;
    let mut any_cancelled = false;
    let mut any_active = false;
    let mut any_started = false;

    for status in statuses {
        match status {
            StageStatus::Failed => any_failed = true,
            StageStatus::Cancelled => any_cancelled = true,
            StageStatus::Pending => any_active = true,
            StageStatus::Running => {
                any_active = true;
                any_started = true;
            }
            StageStatus::Succeeded | StageStatus::Skipped => any_started = true,
        }
    }

    if any_failed {
        RunStatus::Failed
    } else if any_cancelled {
        RunStatus::Cancelled
    } else if any_active {
        if any_started {
            RunStatus::Running
        } else {
            RunStatus::Pending
        }
    } else {
        RunStatus::Succeeded
    }
}
