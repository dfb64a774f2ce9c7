//! Run and stage status models

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Overall status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Admitted by the gate, waiting for the checkout stage to start
    Pending,
    /// Stage walk in progress
    Running,
    /// Every required stage succeeded
    Succeeded,
    /// At least one stage failed
    Failed,
    /// The run was cancelled and no stage failed
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// Status of a single stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    /// Not executed because an earlier stage failed, or there was nothing to run
    Skipped,
    /// Interrupted or never started because the run was cancelled
    Cancelled,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded
                | StageStatus::Failed
                | StageStatus::Skipped
                | StageStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Pending => "pending",
            StageStatus::Running => "running",
            StageStatus::Succeeded => "succeeded",
            StageStatus::Failed => "failed",
            StageStatus::Skipped => "skipped",
            StageStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StageStatus::Pending),
            "running" => Ok(StageStatus::Running),
            "succeeded" => Ok(StageStatus::Succeeded),
            "failed" => Ok(StageStatus::Failed),
            "skipped" => Ok(StageStatus::Skipped),
            "cancelled" => Ok(StageStatus::Cancelled),
            other => Err(format!("unknown stage status: {}", other)),
        }
    }
}

/// The fixed stages of a pipeline, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Checkout,
    Build,
    Test,
    Deploy,
}

impl StageKind {
    pub const ALL: [StageKind; 4] = [
        StageKind::Checkout,
        StageKind::Build,
        StageKind::Test,
        StageKind::Deploy,
    ];

    /// Zero-based position in the stage sequence
    pub fn position(&self) -> i64 {
        match self {
            StageKind::Checkout => 0,
            StageKind::Build => 1,
            StageKind::Test => 2,
            StageKind::Deploy => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Checkout => "checkout",
            StageKind::Build => "build",
            StageKind::Test => "test",
            StageKind::Deploy => "deploy",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "checkout" => Ok(StageKind::Checkout),
            "build" => Ok(StageKind::Build),
            "test" => Ok(StageKind::Test),
            "deploy" => Ok(StageKind::Deploy),
            other => Err(format!("unknown stage kind: {}", other)),
        }
    }
}
