//! Exit gate for agent hooks.
//!
//! An exit-blocking hook runs `relay gate` when the agent tries to stop. The
//! agent may leave once the current session's handoff is on disk; otherwise
//! the hook is told to block with a reason the agent can act on.

use anyhow::Result;
use serde::Serialize;
use tracing::debug;

use crate::io::paths::RelayPaths;
use crate::io::prompt::ProtocolContext;
use crate::io::state_store::{HandoffCheck, StateStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum GateDecision {
    Allow,
    Block { reason: String },
}

impl GateDecision {
    pub fn is_block(&self) -> bool {
        matches!(self, Self::Block { .. })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Decide whether the agent may exit.
///
/// Outside an active relay (no `.active` marker or no session marker) the
/// gate always allows.
pub fn evaluate_gate(paths: &RelayPaths, completion_marker: &str) -> Result<GateDecision> {
    if !paths.active.exists() {
        debug!("no active relay, allowing exit");
        return Ok(GateDecision::Allow);
    }
    let store = StateStore::new(paths.clone());
    let Some(marker) = store.read_session_start()? else {
        debug!("no session marker, allowing exit");
        return Ok(GateDecision::Allow);
    };
    match store.check_handoff(&marker, completion_marker)? {
        HandoffCheck::Valid => Ok(GateDecision::Allow),
        HandoffCheck::Invalid { reason } => {
            let files = ProtocolContext::new(paths, completion_marker, 0, 0);
            Ok(GateDecision::Block {
                reason: format!(
                    "Handoff required before exit ({reason}). Update `{}` and write the next task to `{}`, \
                     or set `STATUS: {completion_marker}` in the progress record if the task is done.",
                    files.progress_path, files.next_task_path,
                ),
            })
        }
    }
}
