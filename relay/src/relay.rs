//! The relay loop: run sessions back to back until the task is done or a stop
//! condition fires.

use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::core::knowledge;
use crate::core::similarity::{LOOP_STRIKES, detect_loop};
use crate::core::types::{Phase, RelayStop, SessionOutcome};
use crate::error::RelayError;
use crate::io::archive::{ArchiveMeta, ArchiveRequest, archived_next_task, write_archive};
use crate::io::config::RelayConfig;
use crate::io::launcher::Launcher;
use crate::io::paths::RelayPaths;
use crate::io::prompt::{PromptInputs, ProtocolContext, build_prompt};
use crate::io::shutdown::CancelFlag;
use crate::io::state_store::StateStore;
use crate::io::status::{StatusRecord, write_status};
use crate::io::verify::{Verifier, VerifyRequest, write_verify_log};
use crate::session::{SessionContext, SessionReport, run_session};

/// Consecutive crashed attempts that stop a relay.
pub const CRASH_LIMIT: u32 = 3;

/// Everything one relay needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub paths: RelayPaths,
    pub config: RelayConfig,
    /// Base task text given to every session.
    pub task: String,
    /// Stage name when run inside a pipeline.
    pub stage: Option<String>,
    /// Pipeline-wide shared knowledge file, named in the prompt.
    pub shared_knowledge: Option<PathBuf>,
}

/// Summary of a relay invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    pub stop: RelayStop,
    /// Session ordinal reached (persisted counter).
    pub last_session: u32,
    /// Attempts launched by this invocation, rate-limited ones included.
    pub attempts: u32,
}

/// One finished attempt, passed to the caller's observer.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub session: u32,
    pub outcome: SessionOutcome,
}

/// Mutable loop state. Lives only for one invocation; the ordinal is mirrored to disk.
#[derive(Debug, Default)]
struct RelayState {
    session: u32,
    attempts: u32,
    consecutive_crashes: u32,
    loop_strikes: u32,
}

/// Removes `.active` on every exit path.
struct ActiveMarker<'a> {
    store: &'a StateStore,
}

impl<'a> ActiveMarker<'a> {
    fn set(store: &'a StateStore) -> Result<Self> {
        store.mark_active(std::process::id())?;
        Ok(Self { store })
    }
}

impl Drop for ActiveMarker<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.store.clear_active() {
            warn!(err = %err, "failed to clear active marker");
        }
    }
}

/// Run sessions until completion, verification, a budget or safety stop, or an interrupt.
///
/// Only I/O failures in the state folder are errors; every stop reason is an
/// `Ok(RelayOutcome)`.
#[instrument(skip_all, fields(workdir = %options.paths.workdir.display(), stage = ?options.stage))]
pub fn run_relay<L, V, F>(
    options: &RelayOptions,
    launcher: &L,
    verifier: &V,
    cancel: &CancelFlag,
    mut on_session: F,
) -> Result<RelayOutcome>
where
    L: Launcher + ?Sized,
    V: Verifier + ?Sized,
    F: FnMut(&SessionEvent),
{
    let config = &options.config;
    let settings = &config.relay;
    let store = StateStore::new(options.paths.clone());
    store.paths().ensure_dirs()?;
    if store.ensure_knowledge()? {
        debug!("created knowledge base");
    }
    let _active = ActiveMarker::set(&store)?;

    let mut state = RelayState {
        session: store.read_session_count()?,
        ..RelayState::default()
    };
    report_status(options, state.session, Phase::Ready, "relay starting");

    if store.is_complete(&settings.completion_marker)? {
        return Ok(finish(options, &state, RelayStop::Completed));
    }

    loop {
        if cancel.is_cancelled() {
            return Ok(finish(options, &state, RelayStop::Interrupted));
        }
        if state.session >= settings.max_sessions {
            let stop = RelayStop::MaxSessions {
                sessions: state.session,
            };
            return Ok(finish(options, &state, stop));
        }

        state.session += 1;
        state.attempts += 1;
        store.write_session_count(state.session)?;
        report_status(options, state.session, Phase::Running, "session running");
        prune_knowledge(&store, settings.knowledge_keep);

        let started_at = Utc::now();
        let (report, prompt) = match session_prompt(options, &store, state.session) {
            Ok(prompt) => {
                let ctx = SessionContext {
                    ordinal: state.session,
                    started_at,
                    prompt,
                };
                (run_session(launcher, &store, &ctx, config)?, ctx.prompt)
            }
            Err(err) => {
                let err = RelayError::PromptBuild {
                    session: state.session,
                    reason: format!("{err:#}"),
                };
                warn!(%err, "counting prompt failure as a crash");
                (SessionReport::crashed_before_launch(err.to_string()), String::new())
            }
        };
        let outcome = report.outcome.clone();
        info!(session = state.session, outcome = %outcome.phase(), "session finished");
        on_session(&SessionEvent {
            session: state.session,
            outcome: outcome.clone(),
        });

        match &outcome {
            SessionOutcome::Interrupted => {
                return Ok(finish(options, &state, RelayStop::Interrupted));
            }
            SessionOutcome::RateLimited { resume_at, reason } => {
                state.session -= 1;
                store.write_session_count(state.session)?;
                let wait = (*resume_at - Utc::now()).to_std().unwrap_or_default();
                report_status(
                    options,
                    state.session,
                    Phase::RateLimited,
                    format!("{reason}; resuming at {resume_at}"),
                );
                info!(wait_secs = wait.as_secs(), "waiting out rate limit");
                if cancel.sleep(wait) {
                    return Ok(finish(options, &state, RelayStop::Interrupted));
                }
                continue;
            }
            SessionOutcome::Crashed { reason } => {
                state.consecutive_crashes += 1;
                archive_session(&store, state.session, started_at, &prompt, &report);
                report_status(options, state.session, Phase::Crashed, reason.clone());
                if state.consecutive_crashes >= CRASH_LIMIT {
                    let err = RelayError::SessionCrash {
                        session: state.session,
                        crashes: state.consecutive_crashes,
                        reason: reason.clone(),
                    };
                    warn!(%err, "stopping relay");
                    let stop = RelayStop::CrashLimit {
                        session: state.session,
                        reason: reason.clone(),
                    };
                    return Ok(finish(options, &state, stop));
                }
            }
            SessionOutcome::HandedOff | SessionOutcome::Rescued { .. } => {
                state.consecutive_crashes = 0;
                archive_session(&store, state.session, started_at, &prompt, &report);
                report_status(options, state.session, outcome.phase(), "handoff recorded");
            }
        }

        if store.is_complete(&settings.completion_marker)? {
            return Ok(finish(options, &state, RelayStop::Completed));
        }

        if let Some(command) = &settings.verify_command {
            let result = verifier.verify(&VerifyRequest {
                workdir: options.paths.workdir.clone(),
                command: command.clone(),
                timeout: settings.verify_timeout(),
            });
            let log_path = options.paths.session_archive(state.session).join("verify.log");
            if let Err(err) = write_verify_log(&log_path, &result) {
                warn!(err = %err, "failed to write verify log");
            }
            if result.passed {
                return Ok(finish(options, &state, RelayStop::Verified));
            }
        }

        if !matches!(outcome, SessionOutcome::Crashed { .. }) {
            let previous = archived_next_task(&options.paths, state.session.saturating_sub(1))?
                .unwrap_or_default();
            let current = store.read_next_task()?;
            let check = detect_loop(&previous, &current, state.session);
            if check.is_loop {
                state.loop_strikes += 1;
                warn!(
                    similarity = check.similarity,
                    strikes = state.loop_strikes,
                    "next task repeats the previous session"
                );
            } else {
                state.loop_strikes = 0;
            }
            if state.loop_strikes >= LOOP_STRIKES {
                let err = RelayError::StuckInLoop {
                    session: state.session,
                    strikes: state.loop_strikes,
                };
                warn!(%err, "stopping relay");
                let stop = RelayStop::StuckInLoop {
                    session: state.session,
                };
                return Ok(finish(options, &state, stop));
            }
        }

        let pause = settings.pause();
        if !pause.is_zero() && state.session < settings.max_sessions {
            debug!(pause_secs = pause.as_secs(), "pausing between sessions");
            if cancel.sleep(pause) {
                return Ok(finish(options, &state, RelayStop::Interrupted));
            }
        }
    }
}

fn session_prompt(options: &RelayOptions, store: &StateStore, session: u32) -> Result<String> {
    let config = &options.config;
    let mut inputs = PromptInputs::load(
        store.paths(),
        session,
        config.relay.max_sessions,
        options.task.clone(),
        options.shared_knowledge.as_deref(),
    )?;
    inputs.stage = options.stage.clone();
    if config.agent.inject_protocol {
        inputs.protocol = Some(ProtocolContext::new(
            store.paths(),
            &config.relay.completion_marker,
            config.agent.warn_budget_percent,
            config.agent.handoff_budget_percent,
        ));
    }
    build_prompt(&inputs, config.agent.prompt_budget_bytes)
}

/// Trim the rolling log before the prompt is built. Failures only warn.
fn prune_knowledge(store: &StateStore, keep: usize) {
    let result = store.read_knowledge().and_then(|text| {
        let (compacted, removed) = knowledge::compact(&text, keep);
        if removed > 0 {
            store.write_knowledge(&compacted)?;
        }
        Ok(removed)
    });
    match result {
        Ok(0) => {}
        Ok(removed) => info!(removed, keep, "pruned knowledge log"),
        Err(err) => warn!(err = %err, "failed to prune knowledge base"),
    }
}

fn archive_session(
    store: &StateStore,
    session: u32,
    started_at: chrono::DateTime<Utc>,
    prompt: &str,
    report: &SessionReport,
) {
    let meta = ArchiveMeta {
        session,
        outcome: report.outcome.phase().to_string(),
        started_at: Some(started_at.to_rfc3339()),
        ended_at: Utc::now().to_rfc3339(),
        tool_uses: report.tool_uses,
        last_tool: report.last_tool.clone(),
        summary: report.summary.clone(),
        stream_errors: report.stream_errors.clone(),
    };
    let request = ArchiveRequest {
        paths: store.paths(),
        session,
        meta: &meta,
        prompt,
        agent_log: report.agent_log.as_deref(),
    };
    match write_archive(&request) {
        Ok(dir) => debug!(dir = %dir.display(), "archived session"),
        Err(err) => warn!(err = %format!("{err:#}"), session, "failed to archive session"),
    }
}

fn report_status(options: &RelayOptions, session: u32, phase: Phase, message: impl Into<String>) {
    let mut record = StatusRecord::now(session, phase, message);
    record.stage = options.stage.clone();
    if let Err(err) = write_status(&options.paths.status, &record) {
        warn!(err = %err, "failed to write status record");
    }
}

fn finish(options: &RelayOptions, state: &RelayState, stop: RelayStop) -> RelayOutcome {
    info!(stop = %stop, session = state.session, attempts = state.attempts, "relay stopped");
    report_status(options, state.session, stop.phase(), stop.to_string());
    RelayOutcome {
        stop,
        last_session: state.session,
        attempts: state.attempts,
    }
}
