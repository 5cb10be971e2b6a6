use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use sweep_runner::{
    CancelFlag, DispatchOptions, Dispatcher, DryRunExecutor, Executor, ExecutorKind,
    LocalProcessExecutor, OutcomeSummary, RunOutcome, SchedulerExecutor, SweepConfig,
};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "sweep",
    version,
    about = "Dispatch experiment runs for every environment file and checkpoint"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ExecutorArg {
    #[value(name = "local_process")]
    LocalProcess,
    #[value(name = "scheduler")]
    Scheduler,
}

impl From<ExecutorArg> for ExecutorKind {
    fn from(value: ExecutorArg) -> Self {
        match value {
            ExecutorArg::LocalProcess => ExecutorKind::LocalProcess,
            ExecutorArg::Scheduler => ExecutorKind::Scheduler,
        }
    }
}

#[derive(Args, Debug, Clone)]
struct SharedArgs {
    /// Dispatcher settings (runner, executor, scheduler, discovery).
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, value_enum)]
    executor: Option<ExecutorArg>,
    /// Runner program; overrides the config file.
    #[arg(long)]
    runner: Option<String>,
    /// Leading runner argument, repeatable. Replaces the configured list.
    #[arg(long = "runner-arg", allow_hyphen_values = true)]
    runner_args: Vec<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Dispatch a single environment file.
    Run {
        env_file: PathBuf,
        #[arg(long)]
        env_root: Option<PathBuf>,
        #[arg(long)]
        multi_checkpoint: bool,
        #[arg(long)]
        dry_run: bool,
        #[command(flatten)]
        shared: SharedArgs,
    },
    /// Dispatch every environment file under a folder.
    RunAll {
        #[arg(long)]
        env_root: PathBuf,
        #[arg(long)]
        recursive: bool,
        #[arg(long)]
        multi_checkpoint: bool,
        #[arg(long)]
        dry_run: bool,
        #[command(flatten)]
        shared: SharedArgs,
    },
    /// Show the loaded config, work items and invocations of one file.
    Describe {
        env_file: PathBuf,
        #[arg(long)]
        multi_checkpoint: bool,
        #[command(flatten)]
        shared: SharedArgs,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    match run_command(cli.command) {
        Ok((payload, ok)) => {
            if let Some(payload) = payload {
                emit_json(&payload);
            }
            if !ok {
                std::process::exit(1);
            }
            Ok(())
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err)));
                std::process::exit(2);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Returns the JSON payload (when `--json`) and whether every item passed.
fn run_command(command: Commands) -> Result<(Option<Value>, bool)> {
    match command {
        Commands::Run {
            env_file,
            env_root,
            multi_checkpoint,
            dry_run,
            shared,
        } => {
            let config = resolve_config(&shared)?;
            let path = resolve_env_file(&env_file, env_root.as_deref());
            let dispatcher = Dispatcher::new(config);
            let options = DispatchOptions {
                multi_checkpoint,
                ..DispatchOptions::default()
            };
            install_cancel_handler(&options.cancel)?;
            let mut executor = make_executor(dispatcher.config(), dry_run);
            let outcomes = dispatcher.run_file(&path, &options, executor.as_mut());
            Ok(report("run", &outcomes, dry_run, shared.json))
        }
        Commands::RunAll {
            env_root,
            recursive,
            multi_checkpoint,
            dry_run,
            shared,
        } => {
            let config = resolve_config(&shared)?;
            let dispatcher = Dispatcher::new(config);
            let options = DispatchOptions {
                recursive,
                multi_checkpoint,
                ..DispatchOptions::default()
            };
            install_cancel_handler(&options.cancel)?;
            let mut executor = make_executor(dispatcher.config(), dry_run);
            let outcomes = dispatcher.run(&env_root, &options, executor.as_mut())?;
            Ok(report("run-all", &outcomes, dry_run, shared.json))
        }
        Commands::Describe {
            env_file,
            multi_checkpoint,
            shared,
        } => {
            let config = resolve_config(&shared)?;
            let cfg = sweep_runner::load(&env_file)?;
            let dispatcher = Dispatcher::new(config);
            let plan = dispatcher.plan_file(&env_file, multi_checkpoint)?;
            if shared.json {
                let items: Vec<Value> = plan
                    .iter()
                    .map(|(item, inv)| {
                        json!({
                            "label": item.label(),
                            "checkpoint": item.checkpoint,
                            "model_path": item.model_path.display().to_string(),
                            "save_folder": item.save_folder.display().to_string(),
                            "invocation": inv.to_json(),
                        })
                    })
                    .collect();
                return Ok((
                    Some(json!({
                        "ok": true,
                        "command": "describe",
                        "source": cfg.source.display().to_string(),
                        "model": cfg.model.display().to_string(),
                        "target_lang": cfg.target_lang,
                        "save_folder": cfg.save_folder.display().to_string(),
                        "data": cfg.data,
                        "prompt": cfg.prompt,
                        "hidden_base": cfg.hidden_base,
                        "hidden_target": cfg.hidden_target,
                        "data_sample_size": cfg.data_sample_size,
                        "margin_variant": cfg.margin_variant,
                        "device": cfg.device,
                        "items": items,
                    })),
                    true,
                ));
            }
            println!("source: {}", cfg.source.display());
            println!("model: {}", cfg.model.display());
            println!("target_lang: {}", cfg.target_lang);
            println!("save_folder: {}", cfg.save_folder.display());
            println!("data: {}", cfg.data);
            println!("prompt: {}", cfg.prompt);
            println!("hidden_base: {}", cfg.hidden_base);
            println!("hidden_target: {}", cfg.hidden_target);
            println!(
                "data_sample_size: {}",
                cfg.data_sample_size.as_deref().unwrap_or("none")
            );
            if let Some(v) = &cfg.margin_variant {
                println!("margin_variant: {}", v);
            }
            if let Some(v) = &cfg.device {
                println!("device: {}", v);
            }
            println!("work_items: {}", plan.len());
            for (item, inv) in &plan {
                println!("- {}: {}", item.label(), inv.shell_line());
            }
            Ok((None, true))
        }
    }
}

/// First Ctrl-C stops new invocations and lets the running item finish.
/// A second one exits immediately.
fn install_cancel_handler(cancel: &CancelFlag) -> Result<()> {
    let flag = cancel.clone();
    ctrlc::set_handler(move || {
        if flag.is_cancelled() {
            std::process::exit(130);
        }
        warn!("interrupt received; finishing the current item, press Ctrl-C again to abort");
        flag.cancel();
    })
    .context("failed to install Ctrl-C handler")
}

fn resolve_config(shared: &SharedArgs) -> Result<SweepConfig> {
    let mut config = match &shared.config {
        Some(path) => {
            let config = SweepConfig::load(path)?;
            debug!(path = %path.display(), "loaded dispatcher config");
            config
        }
        None => SweepConfig::default(),
    };
    if let Some(executor) = shared.executor {
        config.executor = executor.into();
    }
    if let Some(runner) = &shared.runner {
        config.runner.program = runner.clone();
    }
    if !shared.runner_args.is_empty() {
        config.runner.args = shared.runner_args.clone();
    }
    config.validate().context("invalid dispatcher settings")?;
    Ok(config)
}

fn resolve_env_file(env_file: &Path, env_root: Option<&Path>) -> PathBuf {
    match env_root {
        Some(root) if env_file.is_relative() => root.join(env_file),
        _ => env_file.to_path_buf(),
    }
}

fn make_executor(config: &SweepConfig, dry_run: bool) -> Box<dyn Executor> {
    if dry_run {
        return Box::new(DryRunExecutor);
    }
    match config.executor {
        ExecutorKind::LocalProcess => Box::new(LocalProcessExecutor::default()),
        ExecutorKind::Scheduler => Box::new(SchedulerExecutor::new(config.scheduler.clone())),
    }
}

fn report(
    command: &str,
    outcomes: &[RunOutcome],
    dry_run: bool,
    json: bool,
) -> (Option<Value>, bool) {
    let summary = OutcomeSummary::from_outcomes(outcomes);
    let ok = summary.all_ok();
    if json {
        return (
            Some(json!({
                "ok": ok,
                "command": command,
                "dry_run": dry_run,
                "summary": summary.to_json(),
                "outcomes": outcomes.iter().map(RunOutcome::to_json).collect::<Vec<_>>(),
            })),
            ok,
        );
    }
    let mut out = std::io::stdout().lock();
    let mut err = std::io::stderr().lock();
    if let Err(e) = write_text_report(&mut out, &mut err, outcomes, dry_run) {
        debug!(error = %e, "failed to write report");
    }
    (None, ok)
}

/// Outcome lines and the summary go to `out`; failed and cancelled items are
/// repeated on `err`.
fn write_text_report(
    out: &mut impl Write,
    err: &mut impl Write,
    outcomes: &[RunOutcome],
    dry_run: bool,
) -> std::io::Result<()> {
    let summary = OutcomeSummary::from_outcomes(outcomes);
    for outcome in outcomes {
        writeln!(out, "{}", outcome_line(outcome))?;
        if dry_run {
            if let Some(cmd) = &outcome.command {
                writeln!(out, "  {}", cmd)?;
            }
        }
    }
    writeln!(
        out,
        "summary: total={} succeeded={} submitted={} planned={} failed={} cancelled={}",
        summary.total,
        summary.succeeded,
        summary.submitted,
        summary.planned,
        summary.failed,
        summary.cancelled
    )?;
    if !summary.all_ok() {
        writeln!(err, "failures:")?;
        for outcome in outcomes.iter().filter(|o| o.is_failure()) {
            writeln!(err, "  {}", outcome_line(outcome))?;
        }
    }
    Ok(())
}

fn outcome_line(outcome: &RunOutcome) -> String {
    let mut line = format!("{} {}", outcome.status.as_str(), outcome.source.display());
    if let Some(ckpt) = &outcome.checkpoint {
        line.push_str(&format!(" [{}]", ckpt));
    }
    if let Some(code) = outcome.exit_code {
        line.push_str(&format!(" exit={}", code));
    }
    if let Some(err) = &outcome.error {
        line.push_str(&format!(": {}", err));
    }
    line
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { shared, .. }
        | Commands::RunAll { shared, .. }
        | Commands::Describe { shared, .. } => shared.json,
    }
}
