//! Per-session archive snapshots under `archive/session-NNN/`.
//!
//! Archives are for post-mortems and for loop detection (the previous
//! session's next-task copy). Callers treat failures here as warnings.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::io::paths::RelayPaths;
use crate::io::state_store::read_or_empty;

/// Summary written as `meta.json` in each archive folder.
#[derive(Debug, Clone, Serialize)]
pub struct ArchiveMeta {
    pub session: u32,
    pub outcome: String,
    pub started_at: Option<String>,
    pub ended_at: String,
    pub tool_uses: u32,
    pub last_tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub stream_errors: Vec<String>,
}

pub struct ArchiveRequest<'a> {
    pub paths: &'a RelayPaths,
    pub session: u32,
    pub meta: &'a ArchiveMeta,
    pub prompt: &'a str,
    pub agent_log: Option<&'a str>,
}

/// Copy the handoff files and write the session's prompt, agent log and metadata.
pub fn write_archive(request: &ArchiveRequest<'_>) -> Result<PathBuf> {
    let dir = request.paths.session_archive(request.session);
    // A retried stage reuses ordinals; nothing from the earlier attempt may survive.
    match fs::remove_dir_all(&dir) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("clear archive dir {}", dir.display()));
        }
    }
    fs::create_dir_all(&dir).with_context(|| format!("create archive dir {}", dir.display()))?;

    for source in [
        &request.paths.progress,
        &request.paths.next_task,
        &request.paths.knowledge,
        &request.paths.activity_log,
        &request.paths.stream_log,
    ] {
        copy_if_exists(source, &dir)?;
    }

    write_text(&dir.join("prompt.md"), request.prompt)?;
    if let Some(log) = request.agent_log {
        write_text(&dir.join("agent.log"), log)?;
    }
    let mut meta = serde_json::to_string_pretty(request.meta).context("serialize archive meta")?;
    meta.push('\n');
    write_text(&dir.join("meta.json"), &meta)?;
    Ok(dir)
}

/// The archived next-task text of `session`, if that archive exists.
pub fn archived_next_task(paths: &RelayPaths, session: u32) -> Result<Option<String>> {
    let path = paths.session_archive(session).join("next_task.md");
    if !path.exists() {
        return Ok(None);
    }
    Ok(Some(read_or_empty(&path)?))
}

fn copy_if_exists(source: &Path, dir: &Path) -> Result<()> {
    let Some(name) = source.file_name() else {
        return Ok(());
    };
    match fs::copy(source, dir.join(name)) {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("archive {}", source.display())),
    }
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(session: u32) -> ArchiveMeta {
        ArchiveMeta {
            session,
            outcome: "handed_off".to_string(),
            started_at: None,
            ended_at: "2026-01-01T00:00:00Z".to_string(),
            tool_uses: 4,
            last_tool: Some("Edit".to_string()),
            summary: None,
            stream_errors: Vec::new(),
        }
    }

    #[test]
    fn archive_copies_handoff_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RelayPaths::new(temp.path());
        paths.ensure_dirs().expect("dirs");
        fs::write(&paths.progress, "STATUS: IN_PROGRESS\n").expect("progress");
        fs::write(&paths.next_task, "do step 2\n").expect("next");

        let dir = write_archive(&ArchiveRequest {
            paths: &paths,
            session: 2,
            meta: &meta(2),
            prompt: "the prompt",
            agent_log: Some("=== stdout ===\n"),
        })
        .expect("archive");

        assert!(dir.ends_with("archive/session-002"));
        assert!(dir.join("progress.md").is_file());
        assert!(!dir.join("knowledge.md").exists());
        assert_eq!(fs::read_to_string(dir.join("prompt.md")).expect("prompt"), "the prompt");
        assert!(dir.join("agent.log").is_file());
        assert!(dir.join("meta.json").is_file());
        assert_eq!(
            archived_next_task(&paths, 2).expect("read").as_deref(),
            Some("do step 2\n")
        );
        assert_eq!(archived_next_task(&paths, 1).expect("read"), None);
    }

    #[test]
    fn rearchiving_an_ordinal_drops_files_from_the_earlier_attempt() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = RelayPaths::new(temp.path());
        paths.ensure_dirs().expect("dirs");
        let meta = meta(1);
        let request = |prompt| ArchiveRequest {
            paths: &paths,
            session: 1,
            meta: &meta,
            prompt,
            agent_log: None,
        };
        fs::write(&paths.progress, "STATUS: IN_PROGRESS\n").expect("progress");
        fs::write(&paths.next_task, "first attempt step\n").expect("next");
        write_archive(&request("first")).expect("archive");

        fs::remove_file(&paths.next_task).expect("reset next task");
        let dir = write_archive(&request("second")).expect("re-archive");

        assert_eq!(archived_next_task(&paths, 1).expect("read"), None);
        assert_eq!(fs::read_to_string(dir.join("prompt.md")).expect("prompt"), "second");
        assert!(dir.join("progress.md").is_file());
    }
}
