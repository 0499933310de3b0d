//! Shared deterministic types for relay core logic.
//!
//! These types define stable contracts between the launcher, the relay loop and
//! the pipeline orchestrator. They carry no I/O and serialize to stable strings.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Phase written to the machine-readable status record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Ready,
    Running,
    HandedOff,
    Rescued,
    RateLimited,
    Crashed,
    Completed,
    Verified,
    MaxSessions,
    Stuck,
    Interrupted,
    Failed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Running => "running",
            Self::HandedOff => "handed_off",
            Self::Rescued => "rescued",
            Self::RateLimited => "rate_limited",
            Self::Crashed => "crashed",
            Self::Completed => "completed",
            Self::Verified => "verified",
            Self::MaxSessions => "max_sessions",
            Self::Stuck => "stuck",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the agent process ended, independent of whether it handed off.
///
/// Keeps "we stopped it on purpose" apart from "it died".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
    /// The orchestrator sent the termination signal after observing readiness.
    TerminatedByOrchestrator,
    /// The process exited with status 0 on its own.
    ExitedCleanly,
    /// The process exited non-zero, died from a signal, or was force-killed on timeout.
    Crashed { code: Option<i32> },
}

/// Classified result of one session attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// A valid handoff bundle was found.
    HandedOff,
    /// No valid handoff, but activity evidence existed, so the orchestrator wrote one.
    Rescued {
        tool_uses: u32,
        last_tool: Option<String>,
    },
    /// External throttling. The attempt does not count against the session budget.
    RateLimited {
        resume_at: chrono::DateTime<chrono::Utc>,
        reason: String,
    },
    /// No handoff and no evidence of work.
    Crashed { reason: String },
    /// The interrupt flag was raised while the agent was running.
    Interrupted,
}

impl SessionOutcome {
    pub fn phase(&self) -> Phase {
        match self {
            Self::HandedOff => Phase::HandedOff,
            Self::Rescued { .. } => Phase::Rescued,
            Self::RateLimited { .. } => Phase::RateLimited,
            Self::Crashed { .. } => Phase::Crashed,
            Self::Interrupted => Phase::Interrupted,
        }
    }
}

/// Reason a relay stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayStop {
    /// The progress record carries the completion marker.
    Completed,
    /// The verification command exited 0.
    Verified,
    /// The configured session budget was used up.
    MaxSessions { sessions: u32 },
    /// Three consecutive sessions produced near-identical next tasks.
    StuckInLoop { session: u32 },
    /// Three consecutive sessions crashed.
    CrashLimit { session: u32, reason: String },
    /// An interrupt signal was received.
    Interrupted,
}

impl RelayStop {
    /// True for the stops that mean the task is done.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::Verified)
    }

    pub fn phase(&self) -> Phase {
        match self {
            Self::Completed => Phase::Completed,
            Self::Verified => Phase::Verified,
            Self::MaxSessions { .. } => Phase::MaxSessions,
            Self::StuckInLoop { .. } | Self::CrashLimit { .. } => Phase::Stuck,
            Self::Interrupted => Phase::Interrupted,
        }
    }
}

impl fmt::Display for RelayStop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => f.write_str("completion marker detected"),
            Self::Verified => f.write_str("verification command passed"),
            Self::MaxSessions { sessions } => write!(f, "max sessions reached ({sessions})"),
            Self::StuckInLoop { session } => {
                write!(f, "stuck in loop (3 repeated handoffs, last session {session})")
            }
            Self::CrashLimit { session, reason } => {
                write!(f, "3 consecutive crashes (last session {session}): {reason}")
            }
            Self::Interrupted => f.write_str("interrupted"),
        }
    }
}

/// Per-stage status persisted in the pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Dependencies are satisfied by stages that finished or were deliberately skipped.
    pub fn satisfies_dependency(self) -> bool {
        matches!(self, Self::Complete | Self::Skipped)
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// What the pipeline does when a stage fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    #[default]
    Stop,
    Retry,
    Skip,
}

/// How the launcher supervises the agent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchStrategy {
    /// Interactive agent that never exits on its own: poll files for readiness.
    #[default]
    Polling,
    /// Print-mode agent that exits by itself and emits a JSON event stream.
    Streamed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_complete_and_skipped_satisfy_dependencies() {
        assert!(StageStatus::Complete.satisfies_dependency());
        assert!(StageStatus::Skipped.satisfies_dependency());
        assert!(!StageStatus::Pending.satisfies_dependency());
        assert!(!StageStatus::InProgress.satisfies_dependency());
        assert!(!StageStatus::Failed.satisfies_dependency());
    }

    #[test]
    fn stage_status_serializes_snake_case() {
        let json = serde_json::to_string(&StageStatus::InProgress).expect("serialize");
        assert_eq!(json, "\"in_progress\"");
    }

    #[test]
    fn max_sessions_is_not_a_crash_phase() {
        let stop = RelayStop::MaxSessions { sessions: 3 };
        assert_eq!(stop.phase(), Phase::MaxSessions);
        assert!(!stop.is_success());
        assert_eq!(stop.to_string(), "max sessions reached (3)");
    }
}
