//! Application registry and runner settings

use crate::core::state::StageKind;
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Branch used when an application leaves `branch` empty
pub const DEFAULT_BRANCH: &str = "main";

/// A registered application.
///
/// `id` is unique and doubles as the working-directory name under the work root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Git clone URL
    pub repo: String,

    #[serde(default)]
    pub branch: String,

    pub build_cmd: String,

    pub test_cmd: String,

    /// Optional; no deploy stage when empty
    #[serde(default)]
    pub deploy_cmd: String,

    /// Seconds to pause after the build stage
    #[serde(default)]
    pub build_sleep_sec: u64,

    /// Seconds to pause after the test stage
    #[serde(default)]
    pub test_sleep_sec: u64,

    /// Seconds to pause after the deploy stage
    #[serde(default)]
    pub deploy_sleep_sec: u64,
}

impl Application {
    /// Configured branch, or `main` when empty
    pub fn branch_or_default(&self) -> &str {
        if self.branch.trim().is_empty() {
            DEFAULT_BRANCH
        } else {
            self.branch.trim()
        }
    }

    pub fn has_deploy(&self) -> bool {
        !self.deploy_cmd.trim().is_empty()
    }

    /// Command for a stage; checkout has none
    pub fn command(&self, kind: StageKind) -> &str {
        match kind {
            StageKind::Checkout => "",
            StageKind::Build => &self.build_cmd,
            StageKind::Test => &self.test_cmd,
            StageKind::Deploy => &self.deploy_cmd,
        }
    }

    /// Artificial post-stage delay
    pub fn delay(&self, kind: StageKind) -> Duration {
        let secs = match kind {
            StageKind::Checkout => 0,
            StageKind::Build => self.build_sleep_sec,
            StageKind::Test => self.test_sleep_sec,
            StageKind::Deploy => self.deploy_sleep_sec,
        };
        Duration::from_secs(secs)
    }

    /// The fixed stage sequence for this application
    pub fn stage_plan(&self) -> Vec<StageKind> {
        let mut plan = vec![StageKind::Checkout, StageKind::Build, StageKind::Test];
        if self.has_deploy() {
            plan.push(StageKind::Deploy);
        }
        plan
    }

    /// Display name, falling back to the id
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// Root of `apps.yaml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppsConfig {
    #[serde(default)]
    pub apps: Vec<Application>,
}

impl AppsConfig {
    /// Load the registry from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse and validate the registry from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: AppsConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the registry back to YAML
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let yaml = serde_yaml::to_string(self)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, yaml)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn find(&self, id: &str) -> Option<&Application> {
        self.apps.iter().find(|a| a.id == id)
    }

    /// Validate the registry
    pub fn validate(&self) -> Result<()> {
        let id_pattern = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$")?;
        let mut seen_ids = std::collections::HashSet::new();

        for app in &self.apps {
            if !seen_ids.insert(&app.id) {
                anyhow::bail!("Duplicate app ID: {}", app.id);
            }
            if !id_pattern.is_match(&app.id) {
                anyhow::bail!(
                    "App ID '{}' must be usable as a directory name (letters, digits, '.', '_', '-')",
                    app.id
                );
            }
            if app.repo.trim().is_empty() {
                anyhow::bail!("App '{}' has no repo", app.id);
            }
            if app.build_cmd.trim().is_empty() {
                anyhow::bail!("App '{}' has no build_cmd", app.id);
            }
            if app.test_cmd.trim().is_empty() {
                anyhow::bail!("App '{}' has no test_cmd", app.id);
            }
            for kind in [StageKind::Build, StageKind::Test, StageKind::Deploy] {
                let cmd = app.command(kind);
                if !cmd.trim().is_empty() && shlex::split(cmd).is_none() {
                    anyhow::bail!(
                        "App '{}' {} command has unbalanced quotes: {}",
                        app.id,
                        kind,
                        cmd
                    );
                }
            }
        }

        Ok(())
    }
}

/// Settings for the pipeline runner
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Root directory holding one working directory per application
    pub work_dir: PathBuf,

    /// Upper bound on simultaneously active runs across all applications
    pub max_concurrent_runs: usize,

    /// Cap on captured output per stage, in bytes
    pub output_limit_bytes: usize,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("work"),
            max_concurrent_runs: 4,
            output_limit_bytes: 64 * 1024,
        }
    }
}

impl RunnerSettings {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_max_concurrent_runs(mut self, max: usize) -> Self {
        self.max_concurrent_runs = max.max(1);
        self
    }

    pub fn with_output_limit(mut self, bytes: usize) -> Self {
        self.output_limit_bytes = bytes;
        self
    }
}
