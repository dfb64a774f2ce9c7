//! Working-directory checkout

use crate::core::Application;
use crate::execution::cancel::CancelSignal;
use crate::execution::executor::StageExecutor;
use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("failed to run git: {0}")]
    Spawn(String),

    #[error("git exited with code {exit_code:?}: {output}")]
    Git {
        exit_code: Option<i32>,
        output: String,
    },

    #[error("checkout cancelled")]
    Cancelled { output: String },
}

impl CheckoutError {
    /// Output captured before the failure
    pub fn output(&self) -> &str {
        match self {
            CheckoutError::Spawn(message) => message,
            CheckoutError::Git { output, .. } | CheckoutError::Cancelled { output } => output,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CheckoutError::Git { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}

/// Materializes an application's source tree in its working directory
#[async_trait]
pub trait SourceCheckout: Send + Sync + 'static {
    /// Bring `work_dir` to the tip of the application's branch.
    ///
    /// Returns the captured output on success.
    async fn sync(
        &self,
        app: &Application,
        work_dir: &Path,
        cancel: &mut CancelSignal,
    ) -> Result<String, CheckoutError>;
}

/// Git-based checkout: clone when absent, otherwise fetch and hard-reset
#[derive(Debug, Clone)]
pub struct GitCheckout {
    executor: StageExecutor,
}

impl GitCheckout {
    pub fn new(output_limit: usize) -> Self {
        Self {
            executor: StageExecutor::new(output_limit),
        }
    }

    async fn git(
        &self,
        args: &[&str],
        dir: &Path,
        cancel: &mut CancelSignal,
        transcript: &mut String,
    ) -> Result<(), CheckoutError> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        transcript.push_str(&format!("$ git {}\n", args.join(" ")));

        let outcome = self
            .executor
            .run_process("git", &args, dir, cancel)
            .await
            .map_err(|e| CheckoutError::Spawn(e.to_string()))?;
        transcript.push_str(&outcome.output);

        if outcome.cancelled {
            return Err(CheckoutError::Cancelled {
                output: transcript.clone(),
            });
        }
        if !outcome.success {
            return Err(CheckoutError::Git {
                exit_code: outcome.exit_code,
                output: transcript.clone(),
            });
        }
        Ok(())
    }
}

impl Default for GitCheckout {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

#[async_trait]
impl SourceCheckout for GitCheckout {
    async fn sync(
        &self,
        app: &Application,
        work_dir: &Path,
        cancel: &mut CancelSignal,
    ) -> Result<String, CheckoutError> {
        let branch = app.branch_or_default();
        let mut transcript = String::new();

        if work_dir.join(".git").exists() {
            info!("Updating {} to {} tip", work_dir.display(), branch);
            self.git(&["fetch", "origin", branch], work_dir, cancel, &mut transcript)
                .await?;
            self.git(&["checkout", "-f", "-B", branch, "FETCH_HEAD"], work_dir, cancel, &mut transcript)
                .await?;
            self.git(&["reset", "--hard", "FETCH_HEAD"], work_dir, cancel, &mut transcript)
                .await?;
            self.git(&["clean", "-fdx"], work_dir, cancel, &mut transcript)
                .await?;
        } else {
            let parent = match work_dir.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            std::fs::create_dir_all(parent).map_err(|e| CheckoutError::Spawn(e.to_string()))?;
            if work_dir.exists() {
                // Leftover from an interrupted clone
                std::fs::remove_dir_all(work_dir)
                    .map_err(|e| CheckoutError::Spawn(e.to_string()))?;
            }

            info!("Cloning {} ({}) into {}", app.repo, branch, work_dir.display());
            // git runs inside `parent`, so clone into the bare directory name
            let target = work_dir
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_else(|| app.id.clone());
            self.git(
                &["clone", "--branch", branch, "--single-branch", &app.repo, &target],
                parent,
                cancel,
                &mut transcript,
            )
            .await?;
        }

        Ok(transcript)
    }
}
