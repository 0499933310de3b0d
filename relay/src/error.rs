//! Typed failure taxonomy.
//!
//! Everything is propagated as `anyhow::Error`; callers that need to pick an
//! exit code or a recovery path downcast to [`RelayError`].

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Another live orchestrator owns the state folder.
    #[error("another relay is running against {} (lock held by pid {})", path.display(), pid.map_or_else(|| "unknown".to_string(), |p| p.to_string()))]
    LockHeld { path: PathBuf, pid: Option<u32> },

    /// The session ended without a fresh, complete handoff bundle.
    #[error("handoff missing or stale after session {session}: {reason}")]
    MissingOrStaleHandoff { session: u32, reason: String },

    #[error("stuck in loop: {strikes} consecutive near-identical handoffs (last session {session})")]
    StuckInLoop { session: u32, strikes: u32 },

    #[error("session crashed {crashes} times in a row (last session {session}): {reason}")]
    SessionCrash {
        session: u32,
        crashes: u32,
        reason: String,
    },

    #[error("stage '{stage}' depends on '{dependency}', which is {status}")]
    DependencyUnmet {
        stage: String,
        dependency: String,
        status: String,
    },

    #[error("stage '{stage}' depends on unknown stage '{dependency}'")]
    UnknownDependency { stage: String, dependency: String },

    #[error("duplicate stage name '{0}'")]
    DuplicateStage(String),

    #[error("circular stage dependency: {}", cycle.join(" -> "))]
    CircularDependency { cycle: Vec<String> },

    /// Counted as a crash by the relay loop.
    #[error("failed to build prompt for session {session}: {reason}")]
    PromptBuild { session: u32, reason: String },
}
