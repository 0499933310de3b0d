//! Test-only launchers, verifiers and fixtures.
//!
//! Scripted launchers never spawn a process: each queued [`ScriptedSession`]
//! writes the state files an agent would have written and returns a canned
//! [`LaunchReport`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::core::types::AgentExit;
use crate::io::config::RelayConfig;
use crate::io::launcher::{LaunchReport, LaunchRequest, Launcher};
use crate::io::paths::RelayPaths;
use crate::io::shutdown::CancelFlag;
use crate::io::state_store::StateStore;
use crate::io::verify::{VerificationResult, Verifier, VerifyRequest};
use crate::relay::RelayOptions;

/// Filesystem timestamps can trail the wall clock; writes wait this long after launch.
const MTIME_SLACK: Duration = Duration::from_millis(30);

/// What one scripted agent session does.
#[derive(Debug, Clone)]
pub struct ScriptedSession {
    pub progress: Option<String>,
    pub next_task: Option<String>,
    /// Replaces the knowledge base with this core section.
    pub core_knowledge: Option<String>,
    /// Tool names appended to the activity log.
    pub tools: Vec<String>,
    /// Captured output scanned for throttling signatures.
    pub output: String,
    pub exit: AgentExit,
    /// Raise the cancel flag and report an interrupt.
    pub interrupt: bool,
}

impl ScriptedSession {
    fn blank() -> Self {
        Self {
            progress: None,
            next_task: None,
            core_knowledge: None,
            tools: Vec::new(),
            output: String::new(),
            exit: AgentExit::ExitedCleanly,
            interrupt: false,
        }
    }

    /// A normal handoff: progress in progress plus the given next task.
    pub fn handoff(next_task: &str) -> Self {
        Self {
            progress: Some("STATUS: IN_PROGRESS\n".to_string()),
            next_task: Some(next_task.to_string()),
            ..Self::blank()
        }
    }

    /// Declares completion with `marker`.
    pub fn complete(marker: &str) -> Self {
        Self {
            progress: Some(format!("STATUS: {marker}\n\nAll done.\n")),
            ..Self::blank()
        }
    }

    /// Writes nothing and exits non-zero.
    pub fn crash() -> Self {
        Self {
            exit: AgentExit::Crashed { code: Some(1) },
            ..Self::blank()
        }
    }

    /// Prints a throttling message and exits non-zero.
    pub fn rate_limited(message: &str) -> Self {
        Self {
            output: message.to_string(),
            exit: AgentExit::Crashed { code: Some(1) },
            ..Self::blank()
        }
    }

    /// Uses tools but never writes a handoff.
    pub fn silent_work(tools: &[&str]) -> Self {
        Self {
            tools: tools.iter().map(|t| t.to_string()).collect(),
            ..Self::blank()
        }
    }

    pub fn interrupted() -> Self {
        Self {
            interrupt: true,
            exit: AgentExit::Crashed { code: None },
            ..Self::blank()
        }
    }

    pub fn with_knowledge(mut self, core: &str) -> Self {
        self.core_knowledge = Some(core.to_string());
        self
    }
}

/// Replays queued sessions in order and records every request it received.
pub struct ScriptedLauncher {
    sessions: RefCell<VecDeque<ScriptedSession>>,
    requests: RefCell<Vec<LaunchRequest>>,
    cancel: Option<CancelFlag>,
}

impl ScriptedLauncher {
    pub fn new(sessions: Vec<ScriptedSession>) -> Self {
        Self {
            sessions: RefCell::new(sessions.into()),
            requests: RefCell::new(Vec::new()),
            cancel: None,
        }
    }

    /// Interrupting sessions raise this flag.
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn requests(&self) -> Vec<LaunchRequest> {
        self.requests.borrow().clone()
    }

    pub fn remaining(&self) -> usize {
        self.sessions.borrow().len()
    }
}

impl Launcher for ScriptedLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<LaunchReport> {
        self.requests.borrow_mut().push(request.clone());
        let script = self
            .sessions
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted launcher exhausted at session {}", request.session))?;

        thread::sleep(MTIME_SLACK);
        let store = StateStore::new(request.paths.clone());
        if let Some(progress) = &script.progress {
            store.write_progress(progress)?;
        }
        if let Some(next) = &script.next_task {
            store.write_next_task(next)?;
        }
        if let Some(core) = &script.core_knowledge {
            store.write_knowledge(&format!(
                "# Knowledge Base\n\n## Core Knowledge\n\n{core}\n\n## Session Log\n\n### Session {}\n\nscripted\n",
                request.session
            ))?;
        }
        for tool in &script.tools {
            store.record_activity(tool)?;
        }
        if script.interrupt
            && let Some(cancel) = &self.cancel
        {
            cancel.cancel();
        }

        Ok(LaunchReport {
            exit: script.exit,
            timed_out: false,
            interrupted: script.interrupt,
            signature_text: script.output.clone(),
            log: format!("=== stdout ===\n{}\n", script.output),
            stream: None,
        })
    }
}

/// Returns queued pass/fail results; fails once the queue is empty.
pub struct ScriptedVerifier {
    results: RefCell<VecDeque<bool>>,
    calls: RefCell<u32>,
}

impl ScriptedVerifier {
    pub fn new(results: Vec<bool>) -> Self {
        Self {
            results: RefCell::new(results.into()),
            calls: RefCell::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        *self.calls.borrow()
    }
}

impl Verifier for ScriptedVerifier {
    fn verify(&self, _request: &VerifyRequest) -> VerificationResult {
        *self.calls.borrow_mut() += 1;
        let passed = self.results.borrow_mut().pop_front().unwrap_or(false);
        VerificationResult {
            passed,
            exit_code: Some(if passed { 0 } else { 1 }),
            timed_out: false,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::ZERO,
        }
    }
}

/// Config with no waits: zero backoff, no pause, fast polling.
pub fn fast_config() -> RelayConfig {
    let mut cfg = RelayConfig::default();
    cfg.relay.max_sessions = 10;
    cfg.rate_limit.default_backoff_secs = 0;
    cfg.agent.initial_delay_ms = 0;
    cfg.agent.poll_interval_ms = 50;
    cfg.agent.settle_ms = 50;
    cfg.agent.terminate_grace_ms = 1_000;
    cfg.agent.session_timeout_secs = 30;
    cfg
}

/// A temporary working directory with the default state layout.
pub struct TestWorkspace {
    temp: TempDir,
    paths: RelayPaths,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let paths = RelayPaths::new(temp.path());
        paths.ensure_dirs()?;
        Ok(Self { temp, paths })
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn paths(&self) -> &RelayPaths {
        &self.paths
    }

    pub fn store(&self) -> StateStore {
        StateStore::new(self.paths.clone())
    }

    /// Single-relay options for `task` with `config`.
    pub fn options(&self, config: RelayConfig, task: &str) -> RelayOptions {
        RelayOptions {
            paths: self.paths.clone(),
            config,
            task: task.to_string(),
            stage: None,
            shared_knowledge: None,
        }
    }
}
