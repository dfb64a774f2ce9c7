//! Command-line interface

pub mod commands;
pub mod output;

use crate::core::RunnerSettings;
use clap::{Parser, Subcommand};
use commands::{AppsCommand, HistoryCommand, RunCommand, ShowCommand};
use std::ffi::OsString;
use std::path::PathBuf;

/// Build, test and deploy registered applications
#[derive(Debug, Parser, Clone)]
#[command(name = "piaflow")]
#[command(version)]
#[command(about = "Build, test and deploy registered applications", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the application registry
    #[arg(short, long, global = true, default_value = "apps.yaml")]
    pub config: PathBuf,

    /// SQLite database path (defaults to the platform data directory)
    #[arg(long, global = true)]
    pub db: Option<String>,

    /// Root directory for application working directories
    #[arg(long, global = true, default_value = "work")]
    pub work: PathBuf,

    /// Maximum number of runs executing at once
    #[arg(long, global = true, default_value_t = 4)]
    pub max_concurrent: usize,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Trigger a run and follow it to completion
    Run(RunCommand),

    /// List runs of an application, newest first
    History(HistoryCommand),

    /// Show one run with its stages
    Show(ShowCommand),

    /// Validate and list the registered applications
    Apps(AppsCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }

    /// Runner settings from the global flags
    pub fn settings(&self) -> RunnerSettings {
        RunnerSettings::new(&self.work).with_max_concurrent_runs(self.max_concurrent)
    }
}
