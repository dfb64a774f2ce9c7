//! Core domain models
//!
//! Applications, runs, stages and their statuses.

pub mod config;
pub mod run;
pub mod state;

pub use config::{Application, AppsConfig, RunnerSettings};
pub use run::*;
pub use state::*;
