use anyhow::{bail, Context, Result};
use piaflow::auth::{authenticate, Identity};
use piaflow::cli::commands::{AppsCommand, HistoryCommand, RunCommand, ShowCommand};
use piaflow::cli::output::*;
use piaflow::cli::{Cli, Command};
use piaflow::core::{AppsConfig, RunStatus, StageStatus};
use piaflow::execution::{PipelineRunner, RunEvent};
use piaflow::persistence::SqliteRunStore;
use piaflow::seed;
use std::sync::Arc;
use tracing::{error, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    let success = match &cli.command {
        Command::Run(cmd) => run_app(&cli, cmd).await?,
        Command::History(cmd) => show_history(&cli, cmd).await?,
        Command::Show(cmd) => show_run(&cli, cmd).await?,
        Command::Apps(cmd) => list_apps(&cli, cmd)?,
    };

    if !success {
        std::process::exit(1);
    }
    Ok(())
}

async fn open_store(cli: &Cli) -> Result<Arc<SqliteRunStore>> {
    let store = match &cli.db {
        Some(path) => SqliteRunStore::new(path).await,
        None => SqliteRunStore::with_default_path().await,
    }
    .context("Failed to open run store")?;
    Ok(Arc::new(store))
}

fn load_config(cli: &Cli) -> Result<AppsConfig> {
    AppsConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load applications from {}", cli.config.display()))
}

async fn run_app(cli: &Cli, cmd: &RunCommand) -> Result<bool> {
    let config = load_config(cli)?;
    let Some(app) = config.find(&cmd.app) else {
        bail!("Unknown application: {}", cmd.app);
    };

    let store = open_store(cli).await?;
    seed::run(store.as_ref(), &config.apps).await?;

    let identity: Option<Identity> = match (&cmd.user, &cmd.password) {
        (Some(user), Some(password)) => Some(
            authenticate(store.as_ref(), user, password)
                .await
                .context("Authentication failed")?,
        ),
        _ => None,
    };

    let settings = cli.settings();
    std::fs::create_dir_all(&settings.work_dir).with_context(|| {
        format!(
            "Failed to create work directory {}",
            settings.work_dir.display()
        )
    })?;

    let runner = PipelineRunner::new(store, &settings);

    let spinner = create_spinner(format!("{} waiting", app.id));
    let progress = spinner.clone();
    runner.add_event_handler(move |event| {
        progress.println(format_run_event(&event));
        match &event {
            RunEvent::StageStarted { stage, .. } => progress.set_message(format!("{}", stage)),
            RunEvent::RunFinished { .. } => progress.finish_and_clear(),
            _ => {}
        }
    });

    println!(
        "{} Triggering {} ({}@{})",
        INFO,
        style(app.display_name()).bold(),
        style(&app.repo).dim(),
        app.branch_or_default()
    );

    let handle = runner
        .trigger(app, identity.as_ref().map(|i| i.username.as_str()))
        .await?;
    let run_id = handle.id();
    let mut wait = Box::pin(handle.wait());

    let status = tokio::select! {
        status = &mut wait => status,
        _ = tokio::signal::ctrl_c() => {
            spinner.println(format!("{} Cancelling run #{}", WARN, run_id));
            if let Err(e) = runner.cancel(run_id).await {
                warn!("Cancel failed: {}", e);
            }
            wait.await
        }
    };
    spinner.finish_and_clear();

    let run = runner.get_run(run_id).await?;
    println!();
    println!("{}", format_run_summary(&run));

    if status == RunStatus::Succeeded {
        println!(
            "{} {} completed {}",
            CHECK,
            style(app.display_name()).bold(),
            style("successfully").green()
        );
        Ok(true)
    } else {
        let failed = run
            .stages
            .iter()
            .find(|s| s.status == StageStatus::Failed && !s.output.is_empty());
        if let Some(stage) = failed {
            println!("\n{} Output of {}:", INFO, style(stage.kind).bold());
            println!("{}", format_output(&stage.output, 20));
        }
        error!("Run #{} for {} ended {}", run_id, app.id, status);
        Ok(false)
    }
}

async fn show_history(cli: &Cli, cmd: &HistoryCommand) -> Result<bool> {
    let store = open_store(cli).await?;
    let runner = PipelineRunner::new(store, &cli.settings());
    let runs = runner.list_runs(&cmd.app, cmd.limit, cmd.offset).await?;

    if cmd.json {
        let data = serde_json::json!({ "app": cmd.app, "runs": runs });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(true);
    }

    if runs.is_empty() {
        println!("{} No runs found for {}", INFO, style(&cmd.app).bold());
        return Ok(true);
    }

    println!(
        "{} Runs of {} (newest first):",
        INFO,
        style(&cmd.app).bold()
    );
    for run in &runs {
        println!("  {}", format_run_summary(run));
    }
    Ok(true)
}

async fn show_run(cli: &Cli, cmd: &ShowCommand) -> Result<bool> {
    let store = open_store(cli).await?;
    let runner = PipelineRunner::new(store, &cli.settings());
    let run = runner.get_run(cmd.run_id).await?;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(true);
    }

    println!("{} Run #{}", INFO, style(run.id).cyan());
    println!("  Application: {}", style(&run.app_id).bold());
    println!("  Status: {}", format_run_status(run.status));
    if let Some(user) = &run.triggered_by {
        println!("  Triggered by: {}", user);
    }
    println!("  Created: {}", style(run.created_at.to_rfc3339()).dim());
    if let Some(finished) = run.finished_at {
        println!("  Finished: {}", style(finished.to_rfc3339()).dim());
        println!(
            "  Duration: {}",
            format_duration(finished.signed_duration_since(run.created_at))
        );
    }

    println!("\n  {}", style("Stages:").bold());
    for stage in &run.stages {
        let exit = stage
            .exit_code
            .map(|code| format!(" (exit {})", code))
            .unwrap_or_default();
        let duration = stage
            .duration()
            .map(|d| format!(" {}", format_duration(d)))
            .unwrap_or_default();
        println!(
            "    {:<8} {}{}{}",
            stage.kind.as_str(),
            format_stage_status(stage.status),
            exit,
            style(duration).dim()
        );
        if cmd.output && !stage.output.is_empty() {
            for line in stage.output.lines() {
                println!("      {}", line);
            }
        }
    }
    Ok(true)
}

fn list_apps(cli: &Cli, cmd: &AppsCommand) -> Result<bool> {
    let config = match load_config(cli) {
        Ok(config) => config,
        Err(e) => {
            println!("{} Invalid application registry:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            return Ok(false);
        }
    };

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(true);
    }

    if config.apps.is_empty() {
        println!("{} No applications registered", INFO);
        return Ok(true);
    }

    println!("{} {} application(s):", CHECK, config.apps.len());
    for app in &config.apps {
        println!("  {}", format_app(app));
    }
    Ok(true)
}
