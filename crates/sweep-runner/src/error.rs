//! Error taxonomy for loading, expanding and dispatching environment files.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SweepError {
    #[error("environment file not found: {}", .path.display())]
    ConfigNotFound { path: PathBuf },

    #[error("environment file unreadable: {}: {source}", .path.display())]
    ConfigUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}:{line}: malformed line, expected key=value: {content}", .path.display())]
    MalformedLine {
        path: PathBuf,
        line: usize,
        content: String,
    },

    #[error("{}: missing required field '{field}'", .path.display())]
    MissingRequiredField { path: PathBuf, field: &'static str },

    #[error("no checkpoint-* directories found under {}", .model.display())]
    NoCheckpointsFound { model: PathBuf },

    #[error("model directory unreadable: {}: {source}", .model.display())]
    ModelDirUnreadable {
        model: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid value for {flag}: {reason}")]
    InvalidArgumentValue { flag: String, reason: String },

    #[error("failed to create directory {}: {source}", .path.display())]
    DirectoryCreationFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start {program}: {source}")]
    RunnerSpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("runner exited with {}", describe_exit(.code))]
    RunnerExecutionFailed { code: Option<i32> },

    #[error("environment root unreadable: {}: {reason}", .path.display())]
    EnvRootUnreadable { path: PathBuf, reason: String },

    #[error("dispatch cancelled before this item started")]
    Cancelled,

    #[error("failed to record invocation in {}: {message}", .path.display())]
    RecordWriteFailed { path: PathBuf, message: String },
}

impl SweepError {
    /// Stable snake_case code for JSON output.
    pub fn code(&self) -> &'static str {
        match self {
            SweepError::ConfigNotFound { .. } => "config_not_found",
            SweepError::ConfigUnreadable { .. } => "config_unreadable",
            SweepError::MalformedLine { .. } => "malformed_line",
            SweepError::MissingRequiredField { .. } => "missing_required_field",
            SweepError::NoCheckpointsFound { .. } => "no_checkpoints_found",
            SweepError::ModelDirUnreadable { .. } => "model_dir_unreadable",
            SweepError::InvalidArgumentValue { .. } => "invalid_argument_value",
            SweepError::DirectoryCreationFailed { .. } => "directory_creation_failed",
            SweepError::RunnerSpawnFailed { .. } => "runner_spawn_failed",
            SweepError::RunnerExecutionFailed { .. } => "runner_execution_failed",
            SweepError::EnvRootUnreadable { .. } => "env_root_unreadable",
            SweepError::Cancelled => "cancelled",
            SweepError::RecordWriteFailed { .. } => "record_write_failed",
        }
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {}", c),
        None => "signal".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, SweepError>;
