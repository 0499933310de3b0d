//! Stable exit codes for relay CLI commands.

/// Task complete or verified, or a non-run command succeeded.
pub const OK: i32 = 0;
/// Invalid config, stage graph or state, or any other error.
pub const INVALID: i32 = 1;
/// The session budget ran out before completion.
pub const MAX_SESSIONS: i32 = 2;
/// Stopped by loop detection or the consecutive-crash limit.
pub const STUCK: i32 = 3;
/// Another live orchestrator holds the lock.
pub const LOCKED: i32 = 4;
/// A pipeline stage failed and halted the pipeline, or a stage ended failed.
pub const PIPELINE_FAILED: i32 = 5;
/// Interrupted by SIGINT/SIGTERM.
pub const INTERRUPTED: i32 = 130;
