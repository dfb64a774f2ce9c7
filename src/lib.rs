//! piaflow - build, test and deploy pipelines for registered applications

pub mod auth;
pub mod cli;
pub mod core;
pub mod error;
pub mod execution;
pub mod persistence;
pub mod seed;

// Re-export commonly used types
pub use crate::core::{Application, AppsConfig, Run, RunId, RunStatus, RunnerSettings, Stage, StageKind, StageStatus};
pub use error::PipelineError;
pub use execution::{ConcurrencyGate, GitCheckout, PipelineRunner, RunEvent, RunHandle, SourceCheckout, StageExecutor};
pub use persistence::{AccessStore, InMemoryRunStore, RunStore, StoreError};
