//! CLI command definitions

use crate::core::RunId;
use clap::Args;

/// Trigger a run
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Application id
    #[arg(short, long)]
    pub app: String,

    /// Username to verify and record as the trigger
    #[arg(short, long, requires = "password")]
    pub user: Option<String>,

    #[arg(short, long, requires = "user")]
    pub password: Option<String>,
}

/// Show run history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Application id
    #[arg(short, long)]
    pub app: String,

    /// Number of runs to show
    #[arg(short, long, default_value_t = 20)]
    pub limit: usize,

    /// Number of newest runs to skip
    #[arg(long, default_value_t = 0)]
    pub offset: usize,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show one run
#[derive(Debug, Args, Clone)]
pub struct ShowCommand {
    pub run_id: RunId,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    /// Print captured stage output
    #[arg(long)]
    pub output: bool,
}

/// List applications
#[derive(Debug, Args, Clone)]
pub struct AppsCommand {
    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}
