//! CLI output formatting

use crate::{
    core::{Application, Run, RunStatus, StageStatus},
    execution::RunEvent,
};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static STOP: Emoji<'_, '_> = Emoji("🛑 ", "x ");

/// Create a spinner for a running run
pub fn create_spinner(message: String) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed_precise}] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    spinner.set_style(style);
    spinner.set_message(message);
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}

/// Format a run status for display
pub fn format_run_status(status: RunStatus) -> String {
    let label = status.as_str().to_uppercase();
    match status {
        RunStatus::Pending => style(label).dim().to_string(),
        RunStatus::Running => style(label).yellow().to_string(),
        RunStatus::Succeeded => style(label).green().to_string(),
        RunStatus::Failed => style(label).red().to_string(),
        RunStatus::Cancelled => style(label).yellow().to_string(),
    }
}

/// Format a stage status for display
pub fn format_stage_status(status: StageStatus) -> String {
    let label = status.as_str().to_uppercase();
    match status {
        StageStatus::Pending | StageStatus::Skipped => style(label).dim().to_string(),
        StageStatus::Running | StageStatus::Cancelled => style(label).yellow().to_string(),
        StageStatus::Succeeded => style(label).green().to_string(),
        StageStatus::Failed => style(label).red().to_string(),
    }
}

fn status_icon(status: RunStatus) -> Emoji<'static, 'static> {
    match status {
        RunStatus::Succeeded => CHECK,
        RunStatus::Failed => CROSS,
        RunStatus::Cancelled => STOP,
        RunStatus::Running => SPINNER,
        RunStatus::Pending => INFO,
    }
}

pub fn format_duration(duration: chrono::Duration) -> String {
    let millis = duration.num_milliseconds().max(0);
    let secs = millis / 1000;
    if secs < 1 {
        format!("{}ms", millis)
    } else if secs < 60 {
        format!("{}.{}s", secs, (millis % 1000) / 100)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

/// One-line summary of a run for history listings
pub fn format_run_summary(run: &Run) -> String {
    let duration = match run.finished_at {
        Some(finished) => format_duration(finished.signed_duration_since(run.created_at)),
        None => "-".to_string(),
    };
    format!(
        "{} #{} - {} - {} - {}{}",
        status_icon(run.status),
        style(run.id).cyan(),
        format_run_status(run.status),
        style(run.created_at.format("%Y-%m-%d %H:%M:%S")).dim(),
        duration,
        run.triggered_by
            .as_deref()
            .map(|user| format!(" - by {}", user))
            .unwrap_or_default()
    )
}

/// Format a run event for display
pub fn format_run_event(event: &RunEvent) -> String {
    match event {
        RunEvent::RunQueued { run_id, app_id } => format!(
            "{} Queued run {} for {}",
            INFO,
            style(format!("#{}", run_id)).dim(),
            style(app_id).bold()
        ),
        RunEvent::RunStarted { run_id, app_id } => format!(
            "{} Starting run {} for {}",
            ROCKET,
            style(format!("#{}", run_id)).dim(),
            style(app_id).bold()
        ),
        RunEvent::StageStarted { stage, .. } => format!("{} {}", SPINNER, style(stage).cyan()),
        RunEvent::StageFinished {
            stage,
            status,
            exit_code,
            ..
        } => {
            let icon = match status {
                StageStatus::Succeeded => CHECK,
                StageStatus::Failed => CROSS,
                StageStatus::Cancelled => STOP,
                _ => INFO,
            };
            match exit_code {
                Some(code) if *status == StageStatus::Failed => format!(
                    "{} {} {} (exit {})",
                    icon,
                    style(stage).bold(),
                    format_stage_status(*status),
                    code
                ),
                _ => format!(
                    "{} {} {}",
                    icon,
                    style(stage).bold(),
                    format_stage_status(*status)
                ),
            }
        }
        RunEvent::RunFinished { run_id, status, .. } => format!(
            "{} Run {} {}",
            status_icon(*status),
            style(format!("#{}", run_id)).dim(),
            format_run_status(*status)
        ),
    }
}

/// One-line description of an application
pub fn format_app(app: &Application) -> String {
    let stages = app
        .stage_plan()
        .iter()
        .map(|kind| kind.as_str())
        .collect::<Vec<_>>()
        .join(" → ");
    format!(
        "{} ({}) {}@{} [{}]",
        style(&app.id).bold(),
        app.display_name(),
        style(&app.repo).dim(),
        app.branch_or_default(),
        stages
    )
}

/// Format stage output with truncation
pub fn format_output(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.lines().collect();

    if lines.len() <= max_lines {
        output.to_string()
    } else {
        let truncated = lines[..max_lines].join("\n");
        format!(
            "{}\n{}... ({} more lines)",
            truncated,
            style("[truncated]").dim(),
            lines.len() - max_lines
        )
    }
}
