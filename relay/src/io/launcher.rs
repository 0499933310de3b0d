//! Agent process supervision.
//!
//! The [`Launcher`] trait decouples the relay loop from the actual agent
//! process. [`AgentLauncher`] runs the configured command under one of two
//! strategies; tests use scripted launchers that write state files directly.

use std::fs;
use std::process::{Command, ExitStatus};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::core::stream::{StreamTally, parse_line};
use crate::core::types::{AgentExit, LaunchStrategy};
use crate::io::config::{AgentConfig, PromptVia};
use crate::io::paths::RelayPaths;
use crate::io::process::{CommandOutput, RunningChild, WaitEnd};
use crate::io::shutdown::CancelFlag;
use crate::io::state_store::StateStore;

/// Environment variable naming the state folder, for hooks run by the agent.
pub const STATE_DIR_ENV: &str = "RELAY_STATE_DIR";
pub const SESSION_ENV: &str = "RELAY_SESSION";
pub const COMPLETION_MARKER_ENV: &str = "RELAY_COMPLETION_MARKER";

/// Parameters for one agent launch.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub session: u32,
    pub prompt: String,
    pub paths: RelayPaths,
    pub started_at: DateTime<Utc>,
    pub completion_marker: String,
}

/// What the launcher observed. Classification happens in the session module.
#[derive(Debug, Clone)]
pub struct LaunchReport {
    pub exit: AgentExit,
    pub timed_out: bool,
    pub interrupted: bool,
    /// Text scanned for throttling signatures.
    pub signature_text: String,
    /// Rendered stdout/stderr log.
    pub log: String,
    /// Present for the streamed strategy.
    pub stream: Option<StreamTally>,
}

pub trait Launcher {
    fn launch(&self, request: &LaunchRequest) -> Result<LaunchReport>;
}

/// Launches the configured agent command.
pub struct AgentLauncher {
    config: AgentConfig,
    cancel: CancelFlag,
}

impl AgentLauncher {
    pub fn new(config: AgentConfig, cancel: CancelFlag) -> Self {
        Self { config, cancel }
    }

    fn command(&self, request: &LaunchRequest) -> Command {
        let mut cmd = Command::new(&self.config.command[0]);
        cmd.args(&self.config.command[1..]);
        if self.config.prompt_via == PromptVia::Arg {
            cmd.arg(&request.prompt);
        }
        cmd.current_dir(&request.paths.workdir)
            .env(STATE_DIR_ENV, &request.paths.state_dir)
            .env(SESSION_ENV, request.session.to_string())
            .env(COMPLETION_MARKER_ENV, &request.completion_marker);
        cmd
    }

    fn stdin<'a>(&self, request: &'a LaunchRequest) -> Option<&'a [u8]> {
        (self.config.prompt_via == PromptVia::Stdin).then(|| request.prompt.as_bytes())
    }

    fn deadline(&self, started: Instant) -> Instant {
        started + self.config.session_timeout()
    }

    /// Interactive agent: watch the state files and stop the agent once its handoff is stable.
    #[instrument(skip_all, fields(session = request.session))]
    fn launch_polling(&self, request: &LaunchRequest) -> Result<LaunchReport> {
        let started = Instant::now();
        let deadline = self.deadline(started);
        let store = StateStore::new(request.paths.clone());
        let mut running = RunningChild::spawn(
            self.command(request),
            self.stdin(request),
            self.config.output_limit_bytes,
            None,
            |_| {},
        )
        .context("spawn agent")?;
        info!(pid = running.id(), "agent started (polling)");

        let first_poll = (Instant::now() + self.config.initial_delay()).min(deadline);
        if let Some(done) = self.wait_step(&mut running, first_poll, deadline)? {
            return self.report(running, done);
        }

        let mut last_size: Option<u64> = None;
        loop {
            if is_ready(&store, request)? {
                let size = file_size(&request.paths.next_task);
                if last_size == Some(size) {
                    debug!(size, "handoff stable, settling");
                    let settle_end = (Instant::now() + self.config.settle()).min(deadline);
                    if let Some(done) = self.wait_step(&mut running, settle_end, deadline)? {
                        return self.report(running, done);
                    }
                    info!("handoff ready, terminating agent");
                    let status = running.terminate(self.config.terminate_grace())?;
                    let done = StepEnd {
                        exit: AgentExit::TerminatedByOrchestrator,
                        status: Some(status),
                        timed_out: false,
                        interrupted: false,
                    };
                    return self.report(running, done);
                }
                last_size = Some(size);
            } else {
                last_size = None;
            }

            let next_poll = (Instant::now() + self.config.poll_interval()).min(deadline);
            if let Some(done) = self.wait_step(&mut running, next_poll, deadline)? {
                return self.report(running, done);
            }
        }
    }

    /// Print-mode agent: parse the event stream until the process exits.
    #[instrument(skip_all, fields(session = request.session))]
    fn launch_streamed(&self, request: &LaunchRequest) -> Result<LaunchReport> {
        let started = Instant::now();
        let deadline = self.deadline(started);
        let tally = Arc::new(Mutex::new(StreamTally::default()));
        let sink = Arc::clone(&tally);
        let non_json = Arc::new(Mutex::new(String::new()));
        let noise = Arc::clone(&non_json);

        let mut running = RunningChild::spawn(
            self.command(request),
            self.stdin(request),
            self.config.output_limit_bytes,
            Some(&request.paths.stream_log),
            move |line| {
                let text = String::from_utf8_lossy(line);
                match parse_line(&text) {
                    Some(event) => {
                        if let Ok(mut tally) = sink.lock() {
                            tally.observe(&event, Utc::now());
                        }
                    }
                    None => {
                        if let Ok(mut buf) = noise.lock() {
                            buf.push_str(&text);
                        }
                    }
                }
            },
        )
        .context("spawn agent")?;
        info!(pid = running.id(), "agent started (streamed)");

        let done = match self.wait_step(&mut running, deadline, deadline)? {
            Some(done) => done,
            None => self.kill_on_timeout(&mut running)?,
        };
        let mut report = self.report(running, done)?;
        let tally = tally.lock().map(|t| t.clone()).unwrap_or_default();
        let noise = non_json.lock().map(|s| s.clone()).unwrap_or_default();
        report.signature_text = join_text(&noise, &stderr_section(&report.log));
        debug!(
            events = tally.events,
            tool_uses = tally.tool_uses,
            rate_limited = tally.rate_limit.is_some(),
            "stream summary"
        );
        report.stream = Some(tally);
        Ok(report)
    }

    /// Wait until `until`. `Some` means the session is over (exit, interrupt or hard timeout).
    fn wait_step(
        &self,
        running: &mut RunningChild,
        until: Instant,
        deadline: Instant,
    ) -> Result<Option<StepEnd>> {
        match running.wait_until(until, &self.cancel)? {
            WaitEnd::Exited(status) => Ok(Some(StepEnd::exited(status))),
            WaitEnd::Cancelled => {
                warn!("interrupt received, terminating agent");
                let status = running.terminate(self.config.terminate_grace())?;
                Ok(Some(StepEnd {
                    exit: exit_from_status(status),
                    status: Some(status),
                    timed_out: false,
                    interrupted: true,
                }))
            }
            WaitEnd::TimedOut if Instant::now() >= deadline => {
                Ok(Some(self.kill_on_timeout(running)?))
            }
            WaitEnd::TimedOut => Ok(None),
        }
    }

    fn kill_on_timeout(&self, running: &mut RunningChild) -> Result<StepEnd> {
        warn!(
            timeout_secs = self.config.session_timeout_secs,
            "session timed out, killing agent"
        );
        let status = running.terminate(self.config.terminate_grace())?;
        Ok(StepEnd {
            exit: AgentExit::Crashed {
                code: status.code(),
            },
            status: Some(status),
            timed_out: true,
            interrupted: false,
        })
    }

    fn report(&self, running: RunningChild, done: StepEnd) -> Result<LaunchReport> {
        let output: CommandOutput = running.finish(done.status, done.timed_out)?;
        let log = output.render_log("agent");
        Ok(LaunchReport {
            exit: done.exit,
            timed_out: done.timed_out,
            interrupted: done.interrupted,
            signature_text: output.combined_text(),
            log,
            stream: None,
        })
    }
}

impl Launcher for AgentLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<LaunchReport> {
        let report = match self.config.strategy {
            LaunchStrategy::Polling => self.launch_polling(request)?,
            LaunchStrategy::Streamed => self.launch_streamed(request)?,
        };
        if let Err(err) = fs::write(&request.paths.agent_log, &report.log) {
            warn!(err = %err, path = %request.paths.agent_log.display(), "failed to write agent log");
        }
        info!(exit = ?report.exit, timed_out = report.timed_out, "agent finished");
        Ok(report)
    }
}

#[derive(Debug, Clone, Copy)]
struct StepEnd {
    exit: AgentExit,
    status: Option<ExitStatus>,
    timed_out: bool,
    interrupted: bool,
}

impl StepEnd {
    fn exited(status: ExitStatus) -> Self {
        Self {
            exit: exit_from_status(status),
            status: Some(status),
            timed_out: false,
            interrupted: false,
        }
    }
}

fn exit_from_status(status: ExitStatus) -> AgentExit {
    if status.success() {
        AgentExit::ExitedCleanly
    } else {
        AgentExit::Crashed {
            code: status.code(),
        }
    }
}

/// Completion marker in progress, or a handoff signal written this session.
fn is_ready(store: &StateStore, request: &LaunchRequest) -> Result<bool> {
    if store.is_complete(&request.completion_marker)? {
        return Ok(true);
    }
    store.handoff_signal_fresh(request.started_at)
}

fn file_size(path: &std::path::Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn stderr_section(log: &str) -> String {
    log.split_once("=== stderr ===\n")
        .map(|(_, rest)| rest.to_string())
        .unwrap_or_default()
}

fn join_text(a: &str, b: &str) -> String {
    match (a.trim().is_empty(), b.trim().is_empty()) {
        (true, _) => b.to_string(),
        (_, true) => a.to_string(),
        _ => format!("{a}\n{b}"),
    }
}
