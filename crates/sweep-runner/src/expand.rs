use crate::env_file::EnvironmentConfig;
use crate::error::{Result, SweepError};
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

pub const CHECKPOINT_PREFIX: &str = "checkpoint-";

/// One (model snapshot, output location) pair derived from an environment file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub source: PathBuf,
    pub checkpoint: Option<String>,
    pub model_path: PathBuf,
    pub save_folder: PathBuf,
    pub target_lang: String,
    pub data: String,
    pub prompt: String,
    pub hidden_base: String,
    pub hidden_target: String,
    pub data_sample_size: Option<String>,
    pub margin_variant: Option<String>,
    pub device: Option<String>,
}

impl WorkItem {
    fn from_config(config: &EnvironmentConfig, checkpoint: Option<String>) -> Self {
        let (model_path, save_folder) = match &checkpoint {
            Some(name) => (config.model.join(name), config.save_folder.join(name)),
            None => (config.model.clone(), config.save_folder.clone()),
        };
        Self {
            source: config.source.clone(),
            checkpoint,
            model_path,
            save_folder,
            target_lang: config.target_lang.clone(),
            data: config.data.clone(),
            prompt: config.prompt.clone(),
            hidden_base: config.hidden_base.clone(),
            hidden_target: config.hidden_target.clone(),
            data_sample_size: config.data_sample_size.clone(),
            margin_variant: config.margin_variant.clone(),
            device: config.device.clone(),
        }
    }

    /// `<env stem>` or `<env stem>-<checkpoint>`, used for job names and logs.
    pub fn label(&self) -> String {
        let stem = self
            .source
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("env");
        match &self.checkpoint {
            Some(ckpt) => format!("{}-{}", stem, ckpt),
            None => stem.to_string(),
        }
    }
}

pub fn expand(config: &EnvironmentConfig, multi_checkpoint: bool) -> Result<Vec<WorkItem>> {
    if !multi_checkpoint {
        return Ok(vec![WorkItem::from_config(config, None)]);
    }
    let checkpoints = list_checkpoints(&config.model)?;
    if checkpoints.is_empty() {
        return Err(SweepError::NoCheckpointsFound {
            model: config.model.clone(),
        });
    }
    Ok(checkpoints
        .into_iter()
        .map(|name| WorkItem::from_config(config, Some(name)))
        .collect())
}

/// Immediate `checkpoint-<token>` subdirectories of `model`, in checkpoint order.
pub fn list_checkpoints(model: &Path) -> Result<Vec<String>> {
    let unreadable = |source: std::io::Error| SweepError::ModelDirUnreadable {
        model: model.to_path_buf(),
        source,
    };
    let mut names = Vec::new();
    for entry in fs::read_dir(model).map_err(unreadable)? {
        let entry = entry.map_err(unreadable)?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if checkpoint_token(&name).is_none() {
            continue;
        }
        // Follows symlinks: a linked snapshot is still a snapshot.
        if entry.path().is_dir() {
            names.push(name);
        }
    }
    names.sort_by(|a, b| compare_checkpoints(a, b));
    Ok(names)
}

fn checkpoint_token(name: &str) -> Option<&str> {
    name.strip_prefix(CHECKPOINT_PREFIX)
        .filter(|token| !token.is_empty())
}

/// Digits-only tokens with leading zeros removed. Signs and whitespace make a
/// token non-numeric.
fn numeric_digits(token: &str) -> Option<&str> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(token.trim_start_matches('0'))
}

/// Numeric tokens ascend by value and come before non-numeric tokens, which
/// sort lexicographically.
pub fn compare_checkpoints(a: &str, b: &str) -> Ordering {
    let ta = checkpoint_token(a).unwrap_or(a);
    let tb = checkpoint_token(b).unwrap_or(b);
    match (numeric_digits(ta), numeric_digits(tb)) {
        (Some(x), Some(y)) => x
            .len()
            .cmp(&y.len())
            .then_with(|| x.cmp(y))
            .then_with(|| ta.cmp(tb)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => ta.cmp(tb),
    }
}
