//! Relay orchestration for chains of context-limited agent sessions.
//!
//! A relay runs one agent session after another against the same task. Each
//! session hands off to the next through files in a state folder: a progress
//! record, a next-task record and a knowledge base. A pipeline runs several
//! relays as dependent stages.
//!
//! - **[`core`]**: Pure, deterministic logic (completion markers, loop
//!   detection, knowledge compaction, rate-limit parsing, stage graphs).
//! - **[`io`]**: Side-effecting operations (state files, config, locks,
//!   agent processes, verification).
//!
//! Orchestration modules ([`session`], [`relay`], [`pipeline`], [`gate`])
//! combine the two to implement CLI commands.

pub mod core;
pub mod error;
pub mod exit_codes;
pub mod gate;
pub mod io;
pub mod logging;
pub mod pipeline;
pub mod relay;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
