//! Pipeline error taxonomy

use crate::core::{RunId, StageKind};
use crate::persistence::StoreError;
use thiserror::Error;

/// Errors surfaced by the pipeline runner
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A run for this application is already active; retry later
    #[error("application '{0}' already has an active run")]
    Busy(String),

    #[error("checkout failed: {0}")]
    CheckoutFailed(String),

    #[error("{stage} command failed with exit code {}", describe_exit(.exit_code))]
    CommandFailed {
        stage: StageKind,
        exit_code: Option<i32>,
    },

    /// Cancellation or finalization attempted on a terminal run
    #[error("run {0} is already finished")]
    AlreadyFinished(RunId),

    #[error("run {0} not found")]
    RunNotFound(RunId),

    #[error(transparent)]
    StoreUnavailable(StoreError),

    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none (terminated by signal)".to_string(),
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyFinished(id) => PipelineError::AlreadyFinished(id),
            StoreError::NotFound(id) => PipelineError::RunNotFound(id),
            other => PipelineError::StoreUnavailable(other),
        }
    }
}

impl PipelineError {
    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Busy(_) | PipelineError::StoreUnavailable(_)
        )
    }
}
