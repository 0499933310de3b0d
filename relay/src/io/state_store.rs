//! Typed access to the relay's state files.
//!
//! Missing text files read as empty. Freshness is judged by comparing file
//! modification times against the session-start marker.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::completion;
use crate::core::knowledge::KNOWLEDGE_TEMPLATE;
use crate::io::paths::RelayPaths;

/// Contents of `.session_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMarker {
    pub session: u32,
    pub started_at: DateTime<Utc>,
}

/// Whether the files on disk form a usable handoff for the current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandoffCheck {
    Valid,
    Invalid { reason: String },
}

impl HandoffCheck {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    paths: RelayPaths,
}

impl StateStore {
    pub fn new(paths: RelayPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &RelayPaths {
        &self.paths
    }

    pub fn read_progress(&self) -> Result<String> {
        read_or_empty(&self.paths.progress)
    }

    pub fn write_progress(&self, text: &str) -> Result<()> {
        write_atomic(&self.paths.progress, text)
    }

    pub fn read_knowledge(&self) -> Result<String> {
        read_or_empty(&self.paths.knowledge)
    }

    pub fn write_knowledge(&self, text: &str) -> Result<()> {
        write_atomic(&self.paths.knowledge, text)
    }

    /// Seed the knowledge base with its section template if it does not exist.
    pub fn ensure_knowledge(&self) -> Result<bool> {
        if self.paths.knowledge.exists() {
            return Ok(false);
        }
        self.write_knowledge(KNOWLEDGE_TEMPLATE)?;
        Ok(true)
    }

    pub fn read_next_task(&self) -> Result<String> {
        read_or_empty(&self.paths.next_task)
    }

    pub fn write_next_task(&self, text: &str) -> Result<()> {
        write_atomic(&self.paths.next_task, text)
    }

    pub fn is_complete(&self, marker: &str) -> Result<bool> {
        Ok(completion::is_complete(&self.read_progress()?, marker))
    }

    /// Persisted session ordinal. Missing or blank means no session ran yet.
    pub fn read_session_count(&self) -> Result<u32> {
        let raw = read_or_empty(&self.paths.session_count)?;
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(0);
        }
        match trimmed.parse() {
            Ok(count) => Ok(count),
            Err(_) => {
                warn!(value = trimmed, "unparseable session counter, starting from 0");
                Ok(0)
            }
        }
    }

    pub fn write_session_count(&self, count: u32) -> Result<()> {
        write_atomic(&self.paths.session_count, &format!("{count}\n"))
    }

    pub fn write_session_start(&self, session: u32, started_at: DateTime<Utc>) -> Result<SessionMarker> {
        let marker = SessionMarker {
            session,
            started_at,
        };
        let mut buf = serde_json::to_string(&marker).context("serialize session marker")?;
        buf.push('\n');
        write_atomic(&self.paths.session_start, &buf)?;
        Ok(marker)
    }

    pub fn read_session_start(&self) -> Result<Option<SessionMarker>> {
        let raw = match fs::read_to_string(&self.paths.session_start) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read {}", self.paths.session_start.display()));
            }
        };
        let marker = serde_json::from_str(raw.trim())
            .with_context(|| format!("parse {}", self.paths.session_start.display()))?;
        Ok(Some(marker))
    }

    /// Reset per-session signals before a launch.
    pub fn prepare_session(&self, session: u32, started_at: DateTime<Utc>) -> Result<SessionMarker> {
        self.paths.ensure_dirs()?;
        remove_if_exists(&self.paths.handoff_ready)?;
        fs::write(&self.paths.activity_log, "")
            .with_context(|| format!("truncate {}", self.paths.activity_log.display()))?;
        self.write_session_start(session, started_at)
    }

    /// True if the handoff signal file was written after `since`.
    pub fn handoff_signal_fresh(&self, since: DateTime<Utc>) -> Result<bool> {
        modified_after(&self.paths.handoff_ready, since)
    }

    /// Append one tool name to the activity log.
    pub fn record_activity(&self, tool: &str) -> Result<()> {
        if let Some(parent) = self.paths.activity_log.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.paths.activity_log)
            .with_context(|| format!("open {}", self.paths.activity_log.display()))?;
        let name = tool.trim();
        writeln!(file, "{}", if name.is_empty() { "unknown" } else { name })
            .with_context(|| format!("append {}", self.paths.activity_log.display()))
    }

    /// Tool names recorded for the current session.
    pub fn read_activity(&self) -> Result<Vec<String>> {
        Ok(read_or_empty(&self.paths.activity_log)?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Check the handoff bundle against the session-start time.
    ///
    /// Progress and next-task must both be newer than `marker`; next-task must
    /// be non-empty unless the progress record declares completion.
    pub fn check_handoff(&self, marker: &SessionMarker, completion_marker: &str) -> Result<HandoffCheck> {
        let since = marker.started_at;
        if !self.paths.progress.exists() {
            return Ok(invalid("progress record missing"));
        }
        if !modified_after(&self.paths.progress, since)? {
            return Ok(invalid("progress record not updated this session"));
        }
        if self.is_complete(completion_marker)? {
            return Ok(HandoffCheck::Valid);
        }
        if !self.paths.next_task.exists() {
            return Ok(invalid("next-task record missing"));
        }
        if !modified_after(&self.paths.next_task, since)? {
            return Ok(invalid("next-task record not updated this session"));
        }
        if self.read_next_task()?.trim().is_empty() {
            return Ok(invalid("next-task record is empty"));
        }
        Ok(HandoffCheck::Valid)
    }

    pub fn mark_active(&self, pid: u32) -> Result<()> {
        write_atomic(&self.paths.active, &format!("{pid}\n"))
    }

    pub fn clear_active(&self) -> Result<()> {
        remove_if_exists(&self.paths.active)
    }

    /// Start a stage over while keeping what it learned.
    ///
    /// Removes progress, next-task, the session-start marker, the session
    /// counter and the handoff signal. The knowledge base is untouched.
    pub fn reset_for_retry(&self) -> Result<()> {
        for path in [
            &self.paths.progress,
            &self.paths.next_task,
            &self.paths.session_start,
            &self.paths.session_count,
            &self.paths.handoff_ready,
        ] {
            remove_if_exists(path)?;
        }
        debug!(state_dir = %self.paths.state_dir.display(), "state reset for retry");
        Ok(())
    }
}

fn invalid(reason: &str) -> HandoffCheck {
    HandoffCheck::Invalid {
        reason: reason.to_string(),
    }
}

/// Read a text file, treating a missing file as empty.
pub fn read_or_empty(path: &Path) -> Result<String> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

/// True if `path` exists and was modified strictly after `since`.
pub fn modified_after(path: &Path, since: DateTime<Utc>) -> Result<bool> {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err).with_context(|| format!("stat {}", path.display())),
    };
    let modified = meta
        .modified()
        .with_context(|| format!("read mtime of {}", path.display()))?;
    Ok(DateTime::<Utc>::from(modified) > since)
}

pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
    }
}

/// Write via a sibling temp file and rename.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
