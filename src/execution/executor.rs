//! Stage executor - runs one command in a working directory

use crate::core::{StageKind, StageStatus, StageUpdate};
use crate::execution::cancel::CancelSignal;
use chrono::Utc;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Appended to output that hit the cap
pub const TRUNCATION_MARKER: &str = "\n... [output truncated]\n";

/// How long to keep draining pipes after the process has exited
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Byte buffer that stops growing at a fixed cap
#[derive(Debug)]
pub struct OutputBuffer {
    bytes: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            bytes: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        if self.truncated {
            return;
        }
        let remaining = self.limit.saturating_sub(self.bytes.len());
        if data.len() <= remaining {
            self.bytes.extend_from_slice(data);
        } else {
            self.bytes.extend_from_slice(&data[..remaining]);
            self.truncated = true;
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Render as text, with the truncation marker if the cap was hit
    pub fn render(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

/// Result of running one child process
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    /// Exit code; `None` when terminated by a signal
    pub exit_code: Option<i32>,
    pub success: bool,
    /// Combined stdout/stderr, capped
    pub output: String,
    /// The process was killed because the run was cancelled
    pub cancelled: bool,
}

/// Executes stage commands as child processes
#[derive(Debug, Clone)]
pub struct StageExecutor {
    output_limit: usize,
}

impl StageExecutor {
    pub fn new(output_limit: usize) -> Self {
        Self { output_limit }
    }

    pub fn output_limit(&self) -> usize {
        self.output_limit
    }

    /// Run one stage command in `work_dir`, then pause for `delay`.
    ///
    /// The command is split into program and arguments and invoked directly, without
    /// a shell. An empty command is reported as skipped without running anything.
    pub async fn execute(
        &self,
        kind: StageKind,
        work_dir: &Path,
        command: &str,
        delay: Duration,
        cancel: &mut CancelSignal,
    ) -> StageUpdate {
        let argv = match shlex::split(command) {
            Some(argv) => argv,
            None => {
                warn!("Stage {} has an unparseable command: {}", kind, command);
                let now = Utc::now();
                return StageUpdate {
                    kind,
                    status: StageStatus::Failed,
                    started_at: Some(now),
                    finished_at: Some(now),
                    exit_code: None,
                    output: format!("invalid command (unbalanced quotes): {}", command),
                };
            }
        };

        let Some((program, args)) = argv.split_first() else {
            debug!("Stage {} has no command, skipping", kind);
            return StageUpdate::not_run(kind, StageStatus::Skipped);
        };

        if cancel.is_cancelled() {
            return StageUpdate::not_run(kind, StageStatus::Cancelled);
        }

        info!("Executing stage {}: {}", kind, command);
        let started_at = Utc::now();

        let mut update = match self.run_process(program, args, work_dir, cancel).await {
            Ok(outcome) => {
                let status = if outcome.cancelled {
                    StageStatus::Cancelled
                } else if outcome.success {
                    StageStatus::Succeeded
                } else {
                    StageStatus::Failed
                };
                StageUpdate {
                    kind,
                    status,
                    started_at: Some(started_at),
                    finished_at: None,
                    exit_code: outcome.exit_code,
                    output: outcome.output,
                }
            }
            Err(e) => {
                warn!("Failed to start stage {} ({}): {}", kind, program, e);
                StageUpdate {
                    kind,
                    status: StageStatus::Failed,
                    started_at: Some(started_at),
                    finished_at: None,
                    exit_code: None,
                    output: format!("failed to start `{}`: {}", program, e),
                }
            }
        };

        if update.status != StageStatus::Cancelled && !delay.is_zero() {
            debug!("Stage {} pausing for {:?}", kind, delay);
            let interrupted = tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = cancel.cancelled() => true,
            };
            // A command that already failed stays failed
            if interrupted && update.status == StageStatus::Succeeded {
                info!("Stage {} cancelled during its delay", kind);
                update.status = StageStatus::Cancelled;
            } else if interrupted {
                info!("Stage {} delay cut short by cancellation", kind);
            }
        }

        update.finished_at = Some(Utc::now());
        info!("Stage {} finished: {}", kind, update.status);
        update
    }

    /// Spawn `program` with `args` in `dir`, capture combined output, and wait for it.
    ///
    /// Cancellation kills the child and still waits for it to be reaped.
    pub async fn run_process(
        &self,
        program: &str,
        args: &[String],
        dir: &Path,
        cancel: &mut CancelSignal,
    ) -> std::io::Result<ProcessOutcome> {
        let mut child = Command::new(program)
            .args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        debug!("Spawned {} (pid {:?}) in {}", program, child.id(), dir.display());

        let buffer = Arc::new(Mutex::new(OutputBuffer::new(self.output_limit)));
        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump(stdout, buffer.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump(stderr, buffer.clone())));
        }

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        let (status, cancelled) = match waited {
            Some(status) => (status?, false),
            None => {
                info!("Terminating {} (pid {:?})", program, child.id());
                if let Err(e) = child.start_kill() {
                    warn!("Failed to kill {}: {}", program, e);
                }
                (child.wait().await?, true)
            }
        };

        for pump in pumps {
            if tokio::time::timeout(DRAIN_GRACE, pump).await.is_err() {
                debug!("Output of {} still open after exit, abandoning", program);
            }
        }

        let output = match buffer.lock() {
            Ok(buffer) => buffer.render(),
            Err(poisoned) => poisoned.into_inner().render(),
        };

        Ok(ProcessOutcome {
            exit_code: status.code(),
            success: status.success() && !cancelled,
            output,
            cancelled,
        })
    }
}

async fn pump<R: AsyncRead + Unpin>(mut reader: R, buffer: Arc<Mutex<OutputBuffer>>) {
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if let Ok(mut buffer) = buffer.lock() {
                    buffer.push(&chunk[..n]);
                }
            }
        }
    }
}
