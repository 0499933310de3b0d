//! Relay CLI.
//!
//! Runs a single relay against `.relay/` or a multi-stage pipeline, and
//! provides the plumbing commands agent hooks call back into.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use relay::core::completion::status_value;
use relay::core::knowledge::KNOWLEDGE_TEMPLATE;
use relay::core::types::{LaunchStrategy, RelayStop};
use relay::error::RelayError;
use relay::exit_codes;
use relay::gate::evaluate_gate;
use relay::io::config::{RelayConfig, load_config, load_pipeline_config, write_config};
use relay::io::launcher::{AgentLauncher, COMPLETION_MARKER_ENV};
use relay::io::lock::FileLock;
use relay::io::paths::{DEFAULT_STATE_DIR, PipelinePaths, RelayPaths};
use relay::io::pipeline_state::load_pipeline_state;
use relay::io::shutdown::{CancelFlag, install_signal_handler};
use relay::io::state_store::{StateStore, read_or_empty};
use relay::io::status::load_status;
use relay::io::verify::ShellVerifier;
use relay::logging;
use relay::pipeline::{PipelineRun, run_pipeline};
use relay::relay::{RelayOptions, SessionEvent, run_relay};

const TASK_PLACEHOLDER: &str = "# Task\n\nDescribe the task for the agent here.\n";

#[derive(Parser)]
#[command(
    name = "relay",
    version,
    about = "Run chains of context-limited agent sessions that hand off through files"
)]
struct Cli {
    /// Directory the agent works in.
    #[arg(long, global = true, default_value = ".")]
    workdir: PathBuf,
    /// State folder, relative to the working directory.
    #[arg(long, global = true, env = "RELAY_STATE_DIR", default_value = DEFAULT_STATE_DIR)]
    state_dir: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the state folder with a default config, task and knowledge base.
    Init {
        /// Overwrite existing files.
        #[arg(short, long)]
        force: bool,
        /// Task text written to `task.md`.
        #[arg(long)]
        task: Option<String>,
    },
    /// Run one relay until completion or a stop condition.
    Run {
        #[arg(long)]
        max_sessions: Option<u32>,
        #[arg(long)]
        completion_marker: Option<String>,
        /// Shell command whose zero exit ends the relay.
        #[arg(long)]
        verify: Option<String>,
        /// Use the streamed strategy instead of polling.
        #[arg(long)]
        streamed: bool,
    },
    /// Run a multi-stage pipeline from a `pipeline.toml`.
    Pipeline {
        config: PathBuf,
    },
    /// Print the current relay and pipeline status.
    Status,
    /// Print a JSON allow/block decision for an exit-blocking hook.
    Gate {
        #[arg(long, env = COMPLETION_MARKER_ENV)]
        completion_marker: Option<String>,
    },
    /// Append a tool name to the activity log (reads hook JSON from stdin when omitted).
    RecordTool {
        name: Option<String>,
    },
}

fn main() {
    logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            error_exit_code(&err)
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let workdir = fs::canonicalize(&cli.workdir)
        .with_context(|| format!("resolve workdir {}", cli.workdir.display()))?;
    let paths = RelayPaths::with_state_dir(&workdir, &workdir.join(&cli.state_dir));
    match cli.command {
        Command::Init { force, task } => cmd_init(&paths, force, task.as_deref()),
        Command::Run {
            max_sessions,
            completion_marker,
            verify,
            streamed,
        } => {
            let mut config = load_config(&paths.config)?;
            if let Some(max) = max_sessions {
                config.relay.max_sessions = max;
            }
            if let Some(marker) = completion_marker {
                config.relay.completion_marker = marker;
            }
            if verify.is_some() {
                config.relay.verify_command = verify;
            }
            if streamed {
                config.agent.strategy = LaunchStrategy::Streamed;
            }
            config.validate()?;
            cmd_run(&paths, config)
        }
        Command::Pipeline { config } => cmd_pipeline(&paths, &config),
        Command::Status => cmd_status(&paths),
        Command::Gate { completion_marker } => cmd_gate(&paths, completion_marker),
        Command::RecordTool { name } => cmd_record_tool(&paths, name),
    }
}

/// Typed failures pick their own exit code; everything else is invalid input.
fn error_exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<RelayError>() {
        Some(RelayError::LockHeld { .. }) => exit_codes::LOCKED,
        Some(RelayError::StuckInLoop { .. } | RelayError::SessionCrash { .. }) => {
            exit_codes::STUCK
        }
        Some(RelayError::DependencyUnmet { .. }) => exit_codes::PIPELINE_FAILED,
        _ => exit_codes::INVALID,
    }
}

fn stop_exit_code(stop: &RelayStop) -> i32 {
    match stop {
        RelayStop::Completed | RelayStop::Verified => exit_codes::OK,
        RelayStop::MaxSessions { .. } => exit_codes::MAX_SESSIONS,
        RelayStop::StuckInLoop { .. } | RelayStop::CrashLimit { .. } => exit_codes::STUCK,
        RelayStop::Interrupted => exit_codes::INTERRUPTED,
    }
}

fn cmd_init(paths: &RelayPaths, force: bool, task: Option<&str>) -> Result<i32> {
    paths.ensure_dirs()?;
    if force || !paths.config.exists() {
        write_config(&paths.config, &RelayConfig::default())?;
    }
    let task_text = task.map_or_else(|| TASK_PLACEHOLDER.to_string(), |t| format!("{}\n", t.trim()));
    write_if_missing_or_force(&paths.task, &task_text, force || task.is_some())?;
    write_if_missing_or_force(&paths.knowledge, KNOWLEDGE_TEMPLATE, force)?;
    println!("initialized {}", paths.state_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_run(paths: &RelayPaths, config: RelayConfig) -> Result<i32> {
    let task = match &config.relay.task {
        Some(task) => task.clone(),
        None => read_or_empty(&paths.task)?,
    };
    if task.trim().is_empty() {
        bail!(
            "no task: write {} or set relay.task in {}",
            paths.task.display(),
            paths.config.display()
        );
    }

    paths.ensure_dirs()?;
    let _lock = FileLock::new(&paths.lock).hold()?;
    let cancel = CancelFlag::new();
    install_signal_handler(cancel.clone())?;

    let launcher = AgentLauncher::new(config.agent.clone(), cancel.clone());
    let options = RelayOptions {
        paths: paths.clone(),
        config,
        task,
        stage: None,
        shared_knowledge: None,
    };
    let outcome = run_relay(&options, &launcher, &ShellVerifier, &cancel, print_session)?;
    println!(
        "relay stopped after session {}: {}",
        outcome.last_session, outcome.stop
    );
    Ok(stop_exit_code(&outcome.stop))
}

fn cmd_pipeline(paths: &RelayPaths, config_path: &Path) -> Result<i32> {
    let config = load_pipeline_config(config_path)?;
    let base = load_config(&paths.config)?;
    let base_dir = config_path
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    paths.ensure_dirs()?;
    let _lock = FileLock::new(&paths.lock).hold()?;
    let cancel = CancelFlag::new();
    install_signal_handler(cancel.clone())?;

    let pipeline_paths = PipelinePaths::new(&paths.workdir, &paths.state_dir);
    let launcher = AgentLauncher::new(base.agent.clone(), cancel.clone());
    let run = PipelineRun {
        paths: &pipeline_paths,
        config: &config,
        base_dir: &base_dir,
        base: &base,
    };
    let outcome = run_pipeline(&run, &launcher, &ShellVerifier, &cancel, |stage, event| {
        print!("[{stage}] ");
        print_session(event);
    })?;

    for stage in &outcome.stages {
        let detail = stage
            .stop
            .as_ref()
            .map(ToString::to_string)
            .or_else(|| stage.note.clone())
            .unwrap_or_default();
        println!("{:<20} {:<12} {detail}", stage.name, stage.status);
    }
    if outcome.interrupted {
        return Ok(exit_codes::INTERRUPTED);
    }
    Ok(if outcome.is_success() {
        exit_codes::OK
    } else {
        exit_codes::PIPELINE_FAILED
    })
}

fn cmd_status(paths: &RelayPaths) -> Result<i32> {
    let store = StateStore::new(paths.clone());
    match load_status(&paths.status)? {
        Some(status) => {
            println!("phase:    {}", status.phase);
            println!("session:  {}", status.session);
            println!("message:  {}", status.message);
            println!("updated:  {}", status.updated_at.to_rfc3339());
            if let Some(stage) = &status.stage {
                println!("stage:    {stage}");
            }
        }
        None => println!("phase:    (no relay has run)"),
    }
    println!("sessions: {}", store.read_session_count()?);
    let progress = store.read_progress()?;
    println!(
        "progress: {}",
        status_value(&progress).unwrap_or_else(|| "(none)".to_string())
    );
    println!("active:   {}", paths.active.exists());

    let pipeline = PipelinePaths::new(&paths.workdir, &paths.state_dir);
    if let Some(state) = load_pipeline_state(&pipeline.state_file)? {
        println!();
        println!("pipeline: {}", state.name);
        for (name, status) in &state.stages {
            println!("  {name:<20} {status}");
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_gate(paths: &RelayPaths, completion_marker: Option<String>) -> Result<i32> {
    let marker = match completion_marker {
        Some(marker) => marker,
        None => load_config(&paths.config)?.relay.completion_marker,
    };
    let decision = evaluate_gate(paths, &marker)?;
    println!("{}", decision.to_json()?);
    Ok(exit_codes::OK)
}

fn cmd_record_tool(paths: &RelayPaths, name: Option<String>) -> Result<i32> {
    let name = match name {
        Some(name) => name,
        None => {
            let mut raw = String::new();
            std::io::stdin()
                .read_to_string(&mut raw)
                .context("read hook payload from stdin")?;
            tool_name_from_hook(&raw)
        }
    };
    StateStore::new(paths.clone()).record_activity(&name)?;
    Ok(exit_codes::OK)
}

/// `tool_name` from a post-tool hook payload, or `unknown`.
fn tool_name_from_hook(raw: &str) -> String {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|v| v.get("tool_name").and_then(|n| n.as_str()).map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string())
}

fn print_session(event: &SessionEvent) {
    println!("session {}: {}", event.session, event.outcome.phase());
}

fn write_if_missing_or_force(path: &Path, contents: &str, force: bool) -> Result<()> {
    if !force && path.exists() {
        return Ok(());
    }
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
