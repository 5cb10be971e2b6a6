use crate::config::SweepConfig;
use crate::env_file;
use crate::error::{Result, SweepError};
use crate::executor::{Disposition, Executor};
use crate::expand::{self, WorkItem};
use crate::invocation::{self, Invocation};
use chrono::Utc;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use sweep_core::{atomic_write_json_pretty, ensure_dir};
use tracing::{info, warn};
use walkdir::WalkDir;

pub const INVOCATION_RECORD: &str = "sweep_invocation.json";

/// Shared stop switch. Once raised, no further invocation is issued; work
/// already handed to a runner or scheduler is left alone.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    pub recursive: bool,
    pub multi_checkpoint: bool,
    pub cancel: CancelFlag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Succeeded,
    Submitted,
    Planned,
    Failed,
    Cancelled,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeStatus::Succeeded => "succeeded",
            OutcomeStatus::Submitted => "submitted",
            OutcomeStatus::Planned => "planned",
            OutcomeStatus::Failed => "failed",
            OutcomeStatus::Cancelled => "cancelled",
        }
    }
}

/// Result of one work item, or of an environment file that produced none.
#[derive(Debug)]
pub struct RunOutcome {
    pub source: PathBuf,
    pub checkpoint: Option<String>,
    pub save_folder: Option<PathBuf>,
    /// Shell rendering of the invocation, for display only.
    pub command: Option<String>,
    pub status: OutcomeStatus,
    pub exit_code: Option<i32>,
    pub error: Option<SweepError>,
}

impl RunOutcome {
    fn source_failed(source: &Path, error: SweepError) -> Self {
        Self {
            source: source.to_path_buf(),
            checkpoint: None,
            save_folder: None,
            command: None,
            status: OutcomeStatus::Failed,
            exit_code: None,
            error: Some(error),
        }
    }

    fn for_item(item: &WorkItem, status: OutcomeStatus) -> Self {
        Self {
            source: item.source.clone(),
            checkpoint: item.checkpoint.clone(),
            save_folder: Some(item.save_folder.clone()),
            command: None,
            status,
            exit_code: None,
            error: None,
        }
    }

    fn failed(mut self, error: SweepError) -> Self {
        self.status = match error {
            SweepError::Cancelled => OutcomeStatus::Cancelled,
            _ => OutcomeStatus::Failed,
        };
        self.error = Some(error);
        self
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.status, OutcomeStatus::Failed | OutcomeStatus::Cancelled)
    }

    pub fn to_json(&self) -> Value {
        json!({
            "source": self.source.display().to_string(),
            "checkpoint": self.checkpoint,
            "save_folder": self.save_folder.as_ref().map(|p| p.display().to_string()),
            "command": self.command,
            "status": self.status.as_str(),
            "exit_code": self.exit_code,
            "error": self.error.as_ref().map(|e| json!({
                "code": e.code(),
                "message": e.to_string(),
            })),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutcomeSummary {
    pub total: usize,
    pub succeeded: usize,
    pub submitted: usize,
    pub planned: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl OutcomeSummary {
    pub fn from_outcomes(outcomes: &[RunOutcome]) -> Self {
        let mut summary = Self {
            total: outcomes.len(),
            ..Self::default()
        };
        for outcome in outcomes {
            match outcome.status {
                OutcomeStatus::Succeeded => summary.succeeded += 1,
                OutcomeStatus::Submitted => summary.submitted += 1,
                OutcomeStatus::Planned => summary.planned += 1,
                OutcomeStatus::Failed => summary.failed += 1,
                OutcomeStatus::Cancelled => summary.cancelled += 1,
            }
        }
        summary
    }

    pub fn all_ok(&self) -> bool {
        self.failed == 0 && self.cancelled == 0
    }

    pub fn to_json(&self) -> Value {
        json!({
            "total": self.total,
            "succeeded": self.succeeded,
            "submitted": self.submitted,
            "planned": self.planned,
            "failed": self.failed,
            "cancelled": self.cancelled,
        })
    }
}

pub struct Dispatcher {
    config: SweepConfig,
}

impl Dispatcher {
    pub fn new(config: SweepConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Environment files under `env_root`, sorted by path. Hidden entries are
    /// skipped. Fails only when `env_root` itself cannot be read.
    pub fn discover(&self, env_root: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
        let root_err = |reason: String| SweepError::EnvRootUnreadable {
            path: env_root.to_path_buf(),
            reason,
        };
        if !env_root.is_dir() {
            return Err(root_err("not a directory".to_string()));
        }
        fs::read_dir(env_root).map_err(|e| root_err(e.to_string()))?;

        let walker = WalkDir::new(env_root)
            .min_depth(1)
            .max_depth(if recursive { usize::MAX } else { 1 })
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0
                    || !e
                        .file_name()
                        .to_str()
                        .map(|s| s.starts_with('.'))
                        .unwrap_or(false)
            });
        let mut files = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(root = %env_root.display(), error = %err, "skipping unreadable entry");
                    continue;
                }
            };
            let path = entry.path();
            if path.is_file() && self.config.is_env_file(path) {
                files.push(path.to_path_buf());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Dispatch every environment file under `env_root`. A bad file becomes a
    /// failed outcome; it never stops the sweep.
    pub fn run<E: Executor + ?Sized>(
        &self,
        env_root: &Path,
        options: &DispatchOptions,
        executor: &mut E,
    ) -> Result<Vec<RunOutcome>> {
        let files = self.discover(env_root, options.recursive)?;
        info!(
            root = %env_root.display(),
            files = files.len(),
            recursive = options.recursive,
            "discovered environment files"
        );
        let mut outcomes = Vec::new();
        for file in &files {
            outcomes.extend(self.run_file(file, options, executor));
        }
        Ok(outcomes)
    }

    pub fn run_file<E: Executor + ?Sized>(
        &self,
        path: &Path,
        options: &DispatchOptions,
        executor: &mut E,
    ) -> Vec<RunOutcome> {
        let items = match env_file::load(path)
            .and_then(|cfg| expand::expand(&cfg, options.multi_checkpoint))
        {
            Ok(items) => items,
            Err(err) => {
                warn!(file = %path.display(), error = %err, "environment file skipped");
                return vec![RunOutcome::source_failed(path, err)];
            }
        };
        items
            .iter()
            .map(|item| self.dispatch_item(item, &options.cancel, executor))
            .collect()
    }

    /// Load and expand one file and build every invocation, without touching
    /// the filesystem beyond reads.
    pub fn plan_file(
        &self,
        path: &Path,
        multi_checkpoint: bool,
    ) -> Result<Vec<(WorkItem, Invocation)>> {
        let cfg = env_file::load(path)?;
        let items = expand::expand(&cfg, multi_checkpoint)?;
        items
            .into_iter()
            .map(|item| {
                let inv = invocation::build(&item, &self.config.runner)?;
                Ok((item, inv))
            })
            .collect()
    }

    fn dispatch_item<E: Executor + ?Sized>(
        &self,
        item: &WorkItem,
        cancel: &CancelFlag,
        executor: &mut E,
    ) -> RunOutcome {
        let disposition = executor.disposition();
        let mut outcome = RunOutcome::for_item(item, OutcomeStatus::Failed);
        if cancel.is_cancelled() {
            return outcome.failed(SweepError::Cancelled);
        }

        let inv = match invocation::build(item, &self.config.runner) {
            Ok(inv) => inv,
            Err(err) => {
                warn!(item = %item.label(), error = %err, "invocation rejected");
                return outcome.failed(err);
            }
        };
        outcome.command = Some(inv.shell_line());

        if disposition != Disposition::Planned {
            if let Err(err) = self.prepare_save_folder(item, &inv, executor.name()) {
                warn!(item = %item.label(), error = %err, "save folder not prepared");
                return outcome.failed(err);
            }
        }

        info!(
            item = %item.label(),
            executor = executor.name(),
            save_folder = %item.save_folder.display(),
            "dispatching"
        );
        match executor.execute(item, &inv) {
            Ok(exit) if disposition == Disposition::Planned => {
                outcome.status = OutcomeStatus::Planned;
                outcome.exit_code = exit.code;
                outcome
            }
            Ok(exit) if exit.success() => {
                outcome.status = match disposition {
                    Disposition::Submitted => OutcomeStatus::Submitted,
                    _ => OutcomeStatus::Succeeded,
                };
                outcome.exit_code = exit.code;
                outcome
            }
            Ok(exit) => {
                warn!(item = %item.label(), exit_code = ?exit.code, "runner failed");
                outcome.exit_code = exit.code;
                outcome.failed(SweepError::RunnerExecutionFailed { code: exit.code })
            }
            Err(err) => {
                warn!(item = %item.label(), error = %err, "runner did not start");
                outcome.failed(err)
            }
        }
    }

    fn prepare_save_folder(
        &self,
        item: &WorkItem,
        inv: &Invocation,
        executor: &str,
    ) -> Result<()> {
        ensure_dir(&item.save_folder).map_err(|source| SweepError::DirectoryCreationFailed {
            path: item.save_folder.clone(),
            source,
        })?;
        let record = json!({
            "schema_version": "sweep_invocation_v1",
            "source": item.source.display().to_string(),
            "checkpoint": item.checkpoint,
            "label": item.label(),
            "executor": executor,
            "invocation": inv.to_json(),
            "created_at": Utc::now().to_rfc3339(),
        });
        let record_path = item.save_folder.join(INVOCATION_RECORD);
        atomic_write_json_pretty(&record_path, &record).map_err(|e| {
            SweepError::RecordWriteFailed {
                path: record_path.clone(),
                message: e.to_string(),
            }
        })
    }
}
