//! One session attempt: launch the agent, then classify what it left behind.
//!
//! Classification is ordered. An interrupt wins, then a deliberate
//! termination by the orchestrator, then throttling signatures, then a valid
//! handoff bundle, then activity evidence (which triggers a rescue handoff).
//! Anything else is a crash.

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::core::knowledge::{self, KNOWLEDGE_TEMPLATE};
use crate::core::rate_limit::{self, RateLimitSignal};
use crate::core::types::{AgentExit, SessionOutcome};
use crate::error::RelayError;
use crate::io::config::RelayConfig;
use crate::io::launcher::{LaunchReport, LaunchRequest, Launcher};
use crate::io::state_store::{
    HandoffCheck, SessionMarker, StateStore, modified_after, read_or_empty, remove_if_exists,
};

/// In-memory view of the attempt being run.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub ordinal: u32,
    pub started_at: DateTime<Utc>,
    pub prompt: String,
}

/// Classified attempt plus the evidence the archive records.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub outcome: SessionOutcome,
    pub exit: Option<AgentExit>,
    pub timed_out: bool,
    pub tool_uses: u32,
    pub last_tool: Option<String>,
    /// Last assistant text from the event stream.
    pub summary: Option<String>,
    /// Error results and error events from the event stream.
    pub stream_errors: Vec<String>,
    pub agent_log: Option<String>,
}

impl SessionReport {
    /// A crash that happened before the agent produced anything.
    pub fn crashed_before_launch(reason: String) -> Self {
        Self {
            outcome: SessionOutcome::Crashed { reason },
            exit: None,
            timed_out: false,
            tool_uses: 0,
            last_tool: None,
            summary: None,
            stream_errors: Vec::new(),
            agent_log: None,
        }
    }
}

/// Run one attempt and classify it.
///
/// Launcher errors (for example a missing agent binary) become a crashed
/// outcome so the relay's crash counter handles them.
#[instrument(skip_all, fields(session = ctx.ordinal))]
pub fn run_session<L: Launcher + ?Sized>(
    launcher: &L,
    store: &StateStore,
    ctx: &SessionContext,
    config: &RelayConfig,
) -> Result<SessionReport> {
    let marker = store.prepare_session(ctx.ordinal, ctx.started_at)?;
    remove_if_exists(&store.paths().stream_log)?;

    let request = LaunchRequest {
        session: ctx.ordinal,
        prompt: ctx.prompt.clone(),
        paths: store.paths().clone(),
        started_at: ctx.started_at,
        completion_marker: config.relay.completion_marker.clone(),
    };
    let launch = match launcher.launch(&request) {
        Ok(report) => report,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "agent launch failed");
            return Ok(SessionReport::crashed_before_launch(format!(
                "launch failed: {err:#}"
            )));
        }
    };

    classify(store, &marker, &launch, config, Utc::now())
}

/// Turn launcher observations and on-disk state into a [`SessionOutcome`].
pub fn classify(
    store: &StateStore,
    marker: &SessionMarker,
    launch: &LaunchReport,
    config: &RelayConfig,
    now: DateTime<Utc>,
) -> Result<SessionReport> {
    let activity = store.read_activity()?;
    let stream = launch.stream.clone().unwrap_or_default();
    let tool_uses = activity.len() as u32 + stream.tool_uses;
    let last_tool = stream.last_tool.clone().or_else(|| activity.last().cloned());

    let report = |outcome: SessionOutcome| SessionReport {
        outcome,
        exit: Some(launch.exit),
        timed_out: launch.timed_out,
        tool_uses,
        last_tool: last_tool.clone(),
        summary: stream.last_text.clone(),
        stream_errors: stream.errors.clone(),
        agent_log: Some(launch.log.clone()),
    };

    if launch.interrupted {
        return Ok(report(SessionOutcome::Interrupted));
    }

    if launch.exit == AgentExit::TerminatedByOrchestrator {
        return Ok(report(SessionOutcome::HandedOff));
    }

    if let Some(signal) = throttle_signal(store, marker, launch, now)? {
        let resume_at = rate_limit::resume_at(
            &signal,
            now,
            config.rate_limit.default_backoff(),
            config.rate_limit.max_wait(),
        );
        info!(reason = %signal.reason, %resume_at, "rate limit detected");
        return Ok(report(SessionOutcome::RateLimited {
            resume_at,
            reason: signal.reason,
        }));
    }

    let reason = match store.check_handoff(marker, &config.relay.completion_marker)? {
        HandoffCheck::Valid => return Ok(report(SessionOutcome::HandedOff)),
        HandoffCheck::Invalid { reason } => reason,
    };
    let missing = RelayError::MissingOrStaleHandoff {
        session: marker.session,
        reason: reason.clone(),
    };

    if tool_uses > 0 {
        warn!(%missing, tool_uses, "writing rescue handoff");
        write_rescue(store, marker.session, tool_uses, last_tool.as_deref())?;
        return Ok(report(SessionOutcome::Rescued {
            tool_uses,
            last_tool: last_tool.clone(),
        }));
    }

    warn!(%missing, exit = ?launch.exit, timed_out = launch.timed_out, "no handoff and no activity");
    let exit = match launch.exit {
        AgentExit::Crashed { code: Some(code) } => format!("agent exited with code {code}"),
        AgentExit::Crashed { code: None } => "agent killed by signal".to_string(),
        _ => "agent exited".to_string(),
    };
    let timed_out = if launch.timed_out { " after timeout" } else { "" };
    Ok(report(SessionOutcome::Crashed {
        reason: format!("{exit}{timed_out} without a handoff ({reason})"),
    }))
}

/// Throttling evidence from the stream, the captured output, or a progress record written this session.
///
/// Captured output is scanned loosely; the progress record only counts a
/// line-start `STATUS: RATE_LIMITED` or usage-limit notice.
fn throttle_signal(
    store: &StateStore,
    marker: &SessionMarker,
    launch: &LaunchReport,
    now: DateTime<Utc>,
) -> Result<Option<RateLimitSignal>> {
    if let Some(signal) = launch.stream.as_ref().and_then(|s| s.rate_limit.clone()) {
        return Ok(Some(signal));
    }
    if let Some(signal) = rate_limit::detect(&launch.signature_text, now) {
        return Ok(Some(signal));
    }
    let progress = &store.paths().progress;
    if modified_after(progress, marker.started_at)? {
        return Ok(rate_limit::detect_in_record(&read_or_empty(progress)?, now));
    }
    Ok(None)
}

/// Synthesize a handoff for a session that did work but never wrote one.
fn write_rescue(
    store: &StateStore,
    session: u32,
    tool_uses: u32,
    last_tool: Option<&str>,
) -> Result<()> {
    let last_tool = last_tool.unwrap_or("unknown");
    let previous_progress = store.read_progress()?;
    let previous_next = store.read_next_task()?;
    let knowledge_path = store.paths().knowledge.display().to_string();

    let mut progress = format!(
        "STATUS: IN_PROGRESS\n\n\
         Session {session} ended without a handoff after {tool_uses} tool calls \
         (last tool: {last_tool}). This record was written by the orchestrator.\n"
    );
    if !previous_progress.trim().is_empty() {
        progress.push_str("\n## Previous Progress\n\n");
        progress.push_str(previous_progress.trim());
        progress.push('\n');
    }
    store.write_progress(&progress)?;

    let mut next = format!(
        "Recover from session {session}, which stopped without a handoff.\n\n\
         1. Inspect recent version-control history (`git log --stat -5`, `git diff`) to see what changed.\n\
         2. Read the knowledge base at `{knowledge_path}`.\n\
         3. Update the progress record to match the real state, then continue.\n"
    );
    if !previous_next.trim().is_empty() {
        next.push_str("\n## Previous Next Task\n\n");
        next.push_str(previous_next.trim());
        next.push('\n');
    }
    store.write_next_task(&next)?;

    let mut knowledge_text = store.read_knowledge()?;
    if knowledge_text.trim().is_empty() {
        knowledge_text = KNOWLEDGE_TEMPLATE.to_string();
    }
    let entry = format!(
        "Rescue handoff: {tool_uses} tool calls recorded, last tool `{last_tool}`. \
         No handoff files were written."
    );
    let updated = knowledge::append_log_entry(
        &knowledge_text,
        &format!("Session {session} (rescue)"),
        &entry,
    );
    store.write_knowledge(&updated)?;
    Ok(())
}
