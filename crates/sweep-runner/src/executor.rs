use crate::config::SchedulerConfig;
use crate::error::{Result, SweepError};
use crate::expand::WorkItem;
use crate::invocation::Invocation;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::{info, warn};

/// Exit status of the runner, or of the submit command for scheduler jobs.
/// `None` when the process was killed by a signal or never ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerExit {
    pub code: Option<i32>,
}

impl RunnerExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// What a successful `execute` call means for the work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The runner ran to completion before `execute` returned.
    Completed,
    /// A scheduler acknowledged the job; it runs outside this process.
    Submitted,
    /// Nothing ran. Output folders are left untouched.
    Planned,
}

pub trait Executor {
    fn name(&self) -> &'static str;

    fn disposition(&self) -> Disposition {
        Disposition::Completed
    }

    fn execute(&mut self, item: &WorkItem, invocation: &Invocation) -> Result<RunnerExit>;
}

impl<F> Executor for F
where
    F: FnMut(&Invocation) -> Result<RunnerExit>,
{
    fn name(&self) -> &'static str {
        "callback"
    }

    fn execute(&mut self, _item: &WorkItem, invocation: &Invocation) -> Result<RunnerExit> {
        self(invocation)
    }
}

/// Runs the runner directly from its argument vector and waits for it.
#[derive(Debug, Clone, Default)]
pub struct LocalProcessExecutor {
    pub working_dir: Option<PathBuf>,
}

impl Executor for LocalProcessExecutor {
    fn name(&self) -> &'static str {
        "local_process"
    }

    fn execute(&mut self, _item: &WorkItem, invocation: &Invocation) -> Result<RunnerExit> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(invocation.args());
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        // Terminal interrupts go to the dispatcher, which stops scheduling and
        // lets the running item finish.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        let status = cmd.status().map_err(|source| SweepError::RunnerSpawnFailed {
            program: invocation.program.clone(),
            source,
        })?;
        Ok(RunnerExit {
            code: status.code(),
        })
    }
}

/// Submits each invocation as a batch job. The runner argv is shell-quoted
/// into `--wrap`, the only place a command string is built.
#[derive(Debug, Clone, Default)]
pub struct SchedulerExecutor {
    pub config: SchedulerConfig,
}

impl SchedulerExecutor {
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    pub fn submit_args(&self, item: &WorkItem, invocation: &Invocation) -> Vec<String> {
        let mut args = self.config.args.clone();
        args.push("--job-name".to_string());
        args.push(item.label());
        args.push("--wrap".to_string());
        args.push(invocation.shell_line());
        args
    }
}

impl Executor for SchedulerExecutor {
    fn name(&self) -> &'static str {
        "scheduler"
    }

    fn disposition(&self) -> Disposition {
        Disposition::Submitted
    }

    fn execute(&mut self, item: &WorkItem, invocation: &Invocation) -> Result<RunnerExit> {
        let output = Command::new(&self.config.submit)
            .args(self.submit_args(item, invocation))
            .stdin(Stdio::null())
            .output()
            .map_err(|source| SweepError::RunnerSpawnFailed {
                program: self.config.submit.clone(),
                source,
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let ack = stdout.lines().rev().find(|l| !l.trim().is_empty());
        if let Some(line) = ack {
            info!(item = %item.label(), ack = line.trim(), "scheduler acknowledged job");
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(
                item = %item.label(),
                stderr = stderr.trim(),
                "scheduler rejected job"
            );
        }
        Ok(RunnerExit {
            code: output.status.code(),
        })
    }
}

/// Builds invocations without running anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunExecutor;

impl Executor for DryRunExecutor {
    fn name(&self) -> &'static str {
        "dry_run"
    }

    fn disposition(&self) -> Disposition {
        Disposition::Planned
    }

    fn execute(&mut self, _item: &WorkItem, _invocation: &Invocation) -> Result<RunnerExit> {
        Ok(RunnerExit { code: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invocation::{build, RunnerCommand};

    fn item() -> WorkItem {
        WorkItem {
            source: PathBuf::from("/envs/cmn.env"),
            checkpoint: Some("checkpoint-5".to_string()),
            model_path: PathBuf::from("/models/m/checkpoint-5"),
            save_folder: PathBuf::from("/runs/cmn/checkpoint-5"),
            target_lang: "cmn_Hans".to_string(),
            data: "single".to_string(),
            prompt: "zero".to_string(),
            hidden_base: "last".to_string(),
            hidden_target: "last".to_string(),
            data_sample_size: None,
            margin_variant: None,
            device: None,
        }
    }

    fn runner(program: &str, args: &[&str]) -> RunnerCommand {
        RunnerCommand {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn scheduler_wraps_quoted_command_and_names_job() {
        let exec = SchedulerExecutor::new(SchedulerConfig {
            submit: "sbatch".to_string(),
            args: vec!["--gres=gpu:1".to_string()],
        });
        let mut it = item();
        it.prompt = "few shot".to_string();
        let inv = build(&it, &runner("python3", &["wr_experiment.py"])).expect("build");
        let args = exec.submit_args(&it, &inv);
        assert_eq!(args[0], "--gres=gpu:1");
        assert_eq!(args[1..3], ["--job-name".to_string(), "cmn-checkpoint-5".to_string()]);
        assert_eq!(args[3], "--wrap");
        assert!(args[4].starts_with("python3 wr_experiment.py --model /models/m/checkpoint-5"));
        assert!(args[4].contains("--prompt 'few shot'"));
    }

    #[test]
    fn dry_run_plans_without_exit_code() {
        let inv = build(&item(), &RunnerCommand::default()).expect("build");
        let mut exec = DryRunExecutor;
        assert_eq!(exec.disposition(), Disposition::Planned);
        let exit = exec.execute(&item(), &inv).expect("dry run");
        assert_eq!(exit.code, None);
    }

    #[test]
    fn closures_act_as_executors() {
        let inv = build(&item(), &RunnerCommand::default()).expect("build");
        let mut calls = 0;
        let mut exec = |inv: &Invocation| -> Result<RunnerExit> {
            calls += 1;
            assert_eq!(inv.flag("--target-lang"), Some("cmn_Hans"));
            Ok(RunnerExit { code: Some(0) })
        };
        let exit = Executor::execute(&mut exec, &item(), &inv).expect("callback");
        assert!(exit.success());
        assert_eq!(calls, 1);
    }

    #[cfg(unix)]
    #[test]
    fn local_process_reports_exit_codes() {
        let mut exec = LocalProcessExecutor::default();
        let ok = build(&item(), &runner("true", &[])).expect("build");
        assert!(exec.execute(&item(), &ok).expect("true runs").success());

        let bad = build(&item(), &runner("sh", &["-c", "exit 3", "runner"])).expect("build");
        let exit = exec.execute(&item(), &bad).expect("sh runs");
        assert_eq!(exit.code, Some(3));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn local_process_runs_in_its_own_process_group() {
        let mut exec = LocalProcessExecutor::default();
        let script = r#"read -r _ _ _ _ pgrp _ < /proc/$$/stat; [ "$pgrp" = "$$" ]"#;
        let inv = build(&item(), &runner("sh", &["-c", script, "runner"])).expect("build");
        let exit = exec.execute(&item(), &inv).expect("sh runs");
        assert_eq!(exit.code, Some(0));
    }

    #[test]
    fn local_process_reports_missing_program() {
        let mut exec = LocalProcessExecutor::default();
        let inv = build(&item(), &runner("sweep-no-such-runner-binary", &[])).expect("build");
        assert!(matches!(
            exec.execute(&item(), &inv),
            Err(SweepError::RunnerSpawnFailed { .. })
        ));
    }
}
