//! State-folder layout.
//!
//! Every file the relay reads or writes is named here so that the launcher,
//! the relay loop and the pipeline agree on one layout.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Default state folder, relative to the working directory.
pub const DEFAULT_STATE_DIR: &str = ".relay";

/// Paths for one relay (the single-relay state folder or one pipeline stage).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPaths {
    /// Directory the agent runs in.
    pub workdir: PathBuf,
    pub state_dir: PathBuf,
    pub config: PathBuf,
    pub task: PathBuf,
    pub progress: PathBuf,
    pub knowledge: PathBuf,
    pub next_task: PathBuf,
    pub status: PathBuf,
    pub session_start: PathBuf,
    pub active: PathBuf,
    pub session_count: PathBuf,
    pub lock: PathBuf,
    pub handoff_ready: PathBuf,
    pub activity_log: PathBuf,
    pub stream_log: PathBuf,
    pub agent_log: PathBuf,
    pub archive_dir: PathBuf,
}

impl RelayPaths {
    /// Layout rooted at `<workdir>/.relay`.
    pub fn new(workdir: &Path) -> Self {
        Self::with_state_dir(workdir, &workdir.join(DEFAULT_STATE_DIR))
    }

    pub fn with_state_dir(workdir: &Path, state_dir: &Path) -> Self {
        let dir = state_dir.to_path_buf();
        Self {
            workdir: workdir.to_path_buf(),
            config: dir.join("relay.toml"),
            task: dir.join("task.md"),
            progress: dir.join("progress.md"),
            knowledge: dir.join("knowledge.md"),
            next_task: dir.join("next_task.md"),
            status: dir.join("status.json"),
            session_start: dir.join(".session_start"),
            active: dir.join(".active"),
            session_count: dir.join("session_count"),
            lock: dir.join("relay.lock"),
            handoff_ready: dir.join("handoff_ready"),
            activity_log: dir.join("activity.log"),
            stream_log: dir.join("stream.jsonl"),
            agent_log: dir.join("agent.log"),
            archive_dir: dir.join("archive"),
            state_dir: dir,
        }
    }

    /// Archive folder for session `ordinal`, e.g. `archive/session-007`.
    pub fn session_archive(&self, ordinal: u32) -> PathBuf {
        self.archive_dir.join(format!("session-{ordinal:03}"))
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.state_dir)
            .with_context(|| format!("create state dir {}", self.state_dir.display()))?;
        fs::create_dir_all(&self.archive_dir)
            .with_context(|| format!("create archive dir {}", self.archive_dir.display()))?;
        Ok(())
    }
}

/// Paths for a pipeline run, nested under the relay state folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelinePaths {
    pub workdir: PathBuf,
    pub dir: PathBuf,
    pub state_file: PathBuf,
    pub shared_knowledge: PathBuf,
    pub stages_dir: PathBuf,
}

impl PipelinePaths {
    pub fn new(workdir: &Path, state_dir: &Path) -> Self {
        let dir = state_dir.join("pipeline");
        Self {
            workdir: workdir.to_path_buf(),
            state_file: dir.join("pipeline_state.json"),
            shared_knowledge: dir.join("shared_knowledge.md"),
            stages_dir: dir.join("stages"),
            dir,
        }
    }

    /// Relay layout for one stage. Stages share the working directory.
    pub fn stage(&self, name: &str) -> RelayPaths {
        RelayPaths::with_state_dir(&self.workdir, &self.stages_dir.join(name))
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.stages_dir)
            .with_context(|| format!("create pipeline dir {}", self.stages_dir.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_paths_are_stable() {
        let paths = RelayPaths::new(Path::new("/work"));
        assert_eq!(paths.state_dir, Path::new("/work/.relay"));
        assert_eq!(paths.progress, Path::new("/work/.relay/progress.md"));
        assert_eq!(paths.session_start, Path::new("/work/.relay/.session_start"));
        assert_eq!(
            paths.session_archive(7),
            Path::new("/work/.relay/archive/session-007")
        );
    }

    #[test]
    fn stage_paths_nest_under_pipeline() {
        let pipeline = PipelinePaths::new(Path::new("/work"), Path::new("/work/.relay"));
        let stage = pipeline.stage("build");
        assert_eq!(stage.workdir, Path::new("/work"));
        assert_eq!(
            stage.next_task,
            Path::new("/work/.relay/pipeline/stages/build/next_task.md")
        );
        assert_eq!(
            pipeline.state_file,
            Path::new("/work/.relay/pipeline/pipeline_state.json")
        );
    }
}
