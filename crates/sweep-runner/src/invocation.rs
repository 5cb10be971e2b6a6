use crate::error::{Result, SweepError};
use crate::expand::WorkItem;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use sweep_core::sha256_fields;

/// The external program that performs one experiment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for RunnerCommand {
    fn default() -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["wr_experiment.py".to_string()],
        }
    }
}

/// A fully resolved runner call: program, its fixed leading arguments, then
/// `(flag, value)` pairs in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub program_args: Vec<String>,
    pub flags: Vec<(String, String)>,
}

impl Invocation {
    /// Arguments after the program, each one a single argv entry.
    pub fn args(&self) -> Vec<String> {
        let mut out = self.program_args.clone();
        for (flag, value) in &self.flags {
            out.push(flag.clone());
            out.push(value.clone());
        }
        out
    }

    pub fn argv(&self) -> Vec<String> {
        let mut out = vec![self.program.clone()];
        out.extend(self.args());
        out
    }

    pub fn flag(&self, name: &str) -> Option<&str> {
        self.flags
            .iter()
            .find(|(flag, _)| flag == name)
            .map(|(_, value)| value.as_str())
    }

    /// Shell-quoted rendering. Only for display and for schedulers that take a
    /// single command string; local execution never goes through a shell.
    pub fn shell_line(&self) -> String {
        shell_join(&self.argv())
    }

    pub fn digest(&self) -> String {
        sha256_fields(&self.argv())
    }

    pub fn to_json(&self) -> Value {
        json!({
            "program": self.program,
            "argv": self.argv(),
            "digest": self.digest(),
        })
    }
}

pub fn build(item: &WorkItem, runner: &RunnerCommand) -> Result<Invocation> {
    if runner.program.trim().is_empty() {
        return Err(SweepError::InvalidArgumentValue {
            flag: "runner".to_string(),
            reason: "runner program is empty".to_string(),
        });
    }
    check_value("runner", &runner.program)?;
    for arg in &runner.args {
        check_value("runner", arg)?;
    }

    let mut flags = Vec::with_capacity(10);
    let mut push = |flag: &str, value: String| -> Result<()> {
        check_value(flag, &value)?;
        flags.push((flag.to_string(), value));
        Ok(())
    };
    push("--model", path_value("--model", &item.model_path)?)?;
    push("--target-lang", item.target_lang.clone())?;
    push("--save-folder", path_value("--save-folder", &item.save_folder)?)?;
    push("--data", item.data.clone())?;
    push("--prompt", item.prompt.clone())?;
    push("--hidden-base", item.hidden_base.clone())?;
    push("--hidden-target", item.hidden_target.clone())?;

    // Absent means "runner default"; an empty flag value would be a runner error.
    let optional = [
        ("--data-sample-size", &item.data_sample_size),
        ("--margin-variant", &item.margin_variant),
        ("--device", &item.device),
    ];
    for (flag, value) in optional {
        if let Some(v) = value.as_deref().filter(|v| !v.is_empty()) {
            push(flag, v.to_string())?;
        }
    }

    Ok(Invocation {
        program: runner.program.clone(),
        program_args: runner.args.clone(),
        flags,
    })
}

fn path_value(flag: &str, path: &Path) -> Result<String> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| SweepError::InvalidArgumentValue {
            flag: flag.to_string(),
            reason: format!("path is not valid UTF-8: {}", path.display()),
        })
}

fn check_value(flag: &str, value: &str) -> Result<()> {
    if value.contains('\0') {
        return Err(SweepError::InvalidArgumentValue {
            flag: flag.to_string(),
            reason: "value contains a NUL byte".to_string(),
        });
    }
    Ok(())
}

pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}
