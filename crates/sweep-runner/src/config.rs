//! Dispatcher settings loaded from an optional `sweep.yaml`.
//!
//! ```yaml
//! runner:
//!   program: python3
//!   args: [wr_experiment.py]
//! executor: scheduler
//! scheduler:
//!   submit: sbatch
//!   args: ["--gres=gpu:1", "--time=04:00:00"]
//! discovery:
//!   extensions: [env, sh]
//! ```

use crate::invocation::RunnerCommand;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    #[default]
    LocalProcess,
    Scheduler,
}

impl ExecutorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorKind::LocalProcess => "local_process",
            ExecutorKind::Scheduler => "scheduler",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default = "default_submit")]
    pub submit: String,
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_submit() -> String {
    "sbatch".to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            submit: default_submit(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoveryConfig {
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
}

fn default_extensions() -> Vec<String> {
    vec!["env".to_string()]
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepConfig {
    #[serde(default)]
    pub runner: RunnerCommand,
    #[serde(default)]
    pub executor: ExecutorKind,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

impl SweepConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_yaml(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: SweepConfig = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.runner.program.trim().is_empty() {
            return Err(anyhow!("runner.program cannot be empty"));
        }
        if self.scheduler.submit.trim().is_empty() {
            return Err(anyhow!("scheduler.submit cannot be empty"));
        }
        if self.discovery.extensions.is_empty() {
            return Err(anyhow!("discovery.extensions cannot be empty"));
        }
        Ok(())
    }

    /// True when `path` carries one of the configured extensions.
    pub fn is_env_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|ext| {
                self.discovery
                    .extensions
                    .iter()
                    .any(|want| want.trim_start_matches('.') == ext)
            })
            .unwrap_or(false)
    }
}
