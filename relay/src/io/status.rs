//! Machine-readable status record (`status.json`).

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::Phase;
use crate::io::state_store::write_atomic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub session: u32,
    pub phase: Phase,
    pub message: String,
    pub updated_at: DateTime<Utc>,
    pub pid: u32,
    /// Set when the relay runs as a pipeline stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

impl StatusRecord {
    pub fn now(session: u32, phase: Phase, message: impl Into<String>) -> Self {
        Self {
            session,
            phase,
            message: message.into(),
            updated_at: Utc::now(),
            pid: std::process::id(),
            stage: None,
        }
    }
}

pub fn write_status(path: &Path, record: &StatusRecord) -> Result<()> {
    debug!(session = record.session, phase = %record.phase, "writing status");
    let mut buf = serde_json::to_string_pretty(record).context("serialize status")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// `None` when no relay has written a status yet.
pub fn load_status(path: &Path) -> Result<Option<StatusRecord>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let record =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(record))
}
