//! Relay and pipeline configuration.
//!
//! `relay.toml` lives in the state folder and is optional; every field has a
//! default. `pipeline.toml` is passed on the command line and must exist.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::{Deserialize, Serialize};

use crate::core::completion::COMPLETE_SENTINEL;
use crate::core::dag::{StageNode, validate_graph};
use crate::core::types::{FailurePolicy, LaunchStrategy};
use crate::io::state_store::write_atomic;

/// Relay configuration (TOML).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct RelayConfig {
    pub relay: RelaySettings,
    pub agent: AgentConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RelaySettings {
    /// Inline task text. When unset the task is read from `task.md`.
    pub task: Option<String>,
    /// Upper bound on counted sessions.
    pub max_sessions: u32,
    /// Value of the progress `STATUS:` line that ends the relay.
    pub completion_marker: String,
    /// Shell command whose zero exit also ends the relay.
    pub verify_command: Option<String>,
    pub verify_timeout_secs: u64,
    /// Session-log entries kept in the knowledge base.
    pub knowledge_keep: usize,
    /// Pause between sessions.
    pub pause_secs: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            task: None,
            max_sessions: 20,
            completion_marker: COMPLETE_SENTINEL.to_string(),
            verify_command: None,
            verify_timeout_secs: 10 * 60,
            knowledge_keep: 5,
            pause_secs: 0,
        }
    }
}

impl RelaySettings {
    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    pub fn pause(&self) -> Duration {
        Duration::from_secs(self.pause_secs)
    }
}

/// How the prompt reaches the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptVia {
    /// Appended as the final argument.
    #[default]
    Arg,
    Stdin,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent argv, e.g. `["claude", "--dangerously-skip-permissions"]`.
    pub command: Vec<String>,
    pub strategy: LaunchStrategy,
    pub prompt_via: PromptVia,
    /// Hard wall-clock limit for one session.
    pub session_timeout_secs: u64,
    /// Grace period before readiness polling starts.
    pub initial_delay_ms: u64,
    pub poll_interval_ms: u64,
    /// Wait after the handoff looks stable, before terminating the agent.
    pub settle_ms: u64,
    /// Wait between SIGTERM and a hard kill.
    pub terminate_grace_ms: u64,
    /// Captured stdout/stderr per stream, in bytes.
    pub output_limit_bytes: usize,
    /// Prepend the handoff protocol block to every prompt.
    pub inject_protocol: bool,
    /// Prompt size at which optional sections start being dropped.
    pub prompt_budget_bytes: usize,
    /// Context-budget percentage at which the agent should start wrapping up.
    pub warn_budget_percent: u8,
    /// Context-budget percentage at which the agent must hand off.
    pub handoff_budget_percent: u8,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string()],
            strategy: LaunchStrategy::Polling,
            prompt_via: PromptVia::Arg,
            session_timeout_secs: 60 * 60,
            initial_delay_ms: 5_000,
            poll_interval_ms: 2_000,
            settle_ms: 3_000,
            terminate_grace_ms: 5_000,
            output_limit_bytes: 1_000_000,
            inject_protocol: true,
            prompt_budget_bytes: 60_000,
            warn_budget_percent: 60,
            handoff_budget_percent: 80,
        }
    }
}

impl AgentConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Backoff when the throttling message carries no reset time.
    pub default_backoff_secs: u64,
    /// Longest single wait, even if the reset time is later.
    pub max_wait_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_backoff_secs: 5 * 60,
            max_wait_secs: 60 * 60,
        }
    }
}

impl RateLimitConfig {
    pub fn default_backoff(&self) -> Duration {
        Duration::from_secs(self.default_backoff_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.relay.max_sessions == 0 {
            bail!("relay.max_sessions must be > 0");
        }
        if self.relay.completion_marker.trim().is_empty() {
            bail!("relay.completion_marker must not be empty");
        }
        if self.relay.verify_timeout_secs == 0 {
            bail!("relay.verify_timeout_secs must be > 0");
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            bail!("agent.command must be a non-empty array");
        }
        if self.agent.session_timeout_secs == 0 {
            bail!("agent.session_timeout_secs must be > 0");
        }
        if self.agent.poll_interval_ms == 0 {
            bail!("agent.poll_interval_ms must be > 0");
        }
        if self.agent.output_limit_bytes == 0 {
            bail!("agent.output_limit_bytes must be > 0");
        }
        if self.agent.prompt_budget_bytes == 0 {
            bail!("agent.prompt_budget_bytes must be > 0");
        }
        if self.agent.warn_budget_percent >= self.agent.handoff_budget_percent
            || self.agent.handoff_budget_percent > 100
        {
            bail!("agent budget thresholds must satisfy warn < handoff <= 100");
        }
        if self.rate_limit.max_wait_secs == 0 {
            bail!("rate_limit.max_wait_secs must be > 0");
        }
        Ok(())
    }
}

/// Load config from a TOML file. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<RelayConfig> {
    if !path.exists() {
        let cfg = RelayConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: RelayConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &RelayConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Pipeline definition (`pipeline.toml`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineConfig {
    #[serde(default = "default_pipeline_name")]
    pub name: String,
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

fn default_pipeline_name() -> String {
    "pipeline".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageConfig {
    pub name: String,
    /// Prompt file, relative to the pipeline config.
    #[serde(default)]
    pub prompt: Option<PathBuf>,
    /// Inline task text, used when `prompt` is unset.
    #[serde(default)]
    pub task: Option<String>,
    #[serde(default)]
    pub max_sessions: Option<u32>,
    #[serde(default)]
    pub completion_marker: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub verify: Option<String>,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    /// Extra attempts under `on_failure = "retry"`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub share_knowledge: bool,
    #[serde(default)]
    pub skip: bool,
}

fn default_max_retries() -> u32 {
    1
}

impl StageConfig {
    /// Resolve the stage task text. `base_dir` is the directory of the pipeline config.
    pub fn task_text(&self, base_dir: &Path) -> Result<String> {
        if let Some(prompt) = &self.prompt {
            let path = if prompt.is_absolute() {
                prompt.clone()
            } else {
                base_dir.join(prompt)
            };
            return fs::read_to_string(&path).with_context(|| {
                format!("read prompt for stage '{}' at {}", self.name, path.display())
            });
        }
        self.task
            .clone()
            .ok_or_else(|| anyhow!("stage '{}' has neither prompt nor task", self.name))
    }

    /// Relay config for this stage: the base config with stage overrides applied.
    pub fn relay_config(&self, base: &RelayConfig) -> RelayConfig {
        let mut cfg = base.clone();
        if let Some(max) = self.max_sessions {
            cfg.relay.max_sessions = max;
        }
        if let Some(marker) = &self.completion_marker {
            cfg.relay.completion_marker = marker.clone();
        }
        if self.verify.is_some() {
            cfg.relay.verify_command = self.verify.clone();
        }
        cfg
    }
}

impl PipelineConfig {
    /// Structural checks plus dependency-graph validation.
    ///
    /// Graph errors are returned as typed [`crate::error::RelayError`]s.
    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            bail!("pipeline '{}' has no stages", self.name);
        }
        for stage in &self.stages {
            validate_stage_name(&stage.name)?;
            if stage.prompt.is_none() && stage.task.is_none() {
                bail!("stage '{}' needs a prompt file or an inline task", stage.name);
            }
            if stage.max_sessions == Some(0) {
                bail!("stage '{}' max_sessions must be > 0", stage.name);
            }
        }
        let nodes: Vec<StageNode<'_>> = self
            .stages
            .iter()
            .map(|s| StageNode {
                name: &s.name,
                depends_on: &s.depends_on,
            })
            .collect();
        validate_graph(&nodes)?;
        Ok(())
    }
}

/// Stage names become directory names.
fn validate_stage_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && name != "."
        && name != "..";
    if !ok {
        bail!("invalid stage name '{name}' (use letters, digits, '-', '_', '.')");
    }
    Ok(())
}

/// Load and validate a pipeline config.
pub fn load_pipeline_config(path: &Path) -> Result<PipelineConfig> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PipelineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, RelayConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("relay.toml");
        let mut cfg = RelayConfig::default();
        cfg.relay.verify_command = Some("cargo test".to_string());
        cfg.agent.strategy = LaunchStrategy::Streamed;
        write_config(&path, &cfg).expect("write");
        assert_eq!(load_config(&path).expect("load"), cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("relay.toml");
        fs::write(
            &path,
            "[relay]\nmax_sessions = 3\n\n[agent]\ncommand = [\"sh\", \"agent.sh\"]\nprompt_via = \"stdin\"\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.relay.max_sessions, 3);
        assert_eq!(cfg.agent.prompt_via, PromptVia::Stdin);
        assert_eq!(cfg.agent.poll_interval_ms, AgentConfig::default().poll_interval_ms);
    }

    #[test]
    fn rejects_empty_command() {
        let mut cfg = RelayConfig::default();
        cfg.agent.command.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_inverted_budget_thresholds() {
        let mut cfg = RelayConfig::default();
        cfg.agent.warn_budget_percent = 90;
        cfg.agent.handoff_budget_percent = 80;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn pipeline_parses_stages_with_defaults() {
        let cfg: PipelineConfig = toml::from_str(
            r#"
name = "ship"

[[stages]]
name = "design"
task = "write the design"
share_knowledge = true

[[stages]]
name = "build"
prompt = "prompts/build.md"
depends_on = ["design"]
on_failure = "retry"
max_retries = 2
"#,
        )
        .expect("parse");
        cfg.validate().expect("valid");
        let [design, build] = cfg.stages.as_slice() else {
            panic!("expected two stages");
        };
        assert_eq!(build.on_failure, FailurePolicy::Retry);
        assert_eq!(build.max_retries, 2);
        assert_eq!(design.on_failure, FailurePolicy::Stop);
    }

    #[test]
    fn pipeline_cycle_is_typed() {
        let cfg: PipelineConfig = toml::from_str(
            r#"
[[stages]]
name = "a"
task = "a"
depends_on = ["b"]

[[stages]]
name = "b"
task = "b"
depends_on = ["a"]
"#,
        )
        .expect("parse");
        let err = cfg.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::CircularDependency { .. })
        ));
    }

    #[test]
    fn pipeline_rejects_path_like_stage_names() {
        let cfg: PipelineConfig =
            toml::from_str("[[stages]]\nname = \"../escape\"\ntask = \"x\"\n").expect("parse");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn stage_overrides_apply() {
        let stage = StageConfig {
            name: "build".to_string(),
            prompt: None,
            task: Some("t".to_string()),
            max_sessions: Some(4),
            completion_marker: Some("BUILT".to_string()),
            depends_on: Vec::new(),
            verify: Some("make test".to_string()),
            on_failure: FailurePolicy::Stop,
            max_retries: 1,
            share_knowledge: false,
            skip: false,
        };
        let cfg = stage.relay_config(&RelayConfig::default());
        assert_eq!(cfg.relay.max_sessions, 4);
        assert_eq!(cfg.relay.completion_marker, "BUILT");
        assert_eq!(cfg.relay.verify_command.as_deref(), Some("make test"));
    }

    #[test]
    fn stage_prompt_resolves_relative_to_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("prompts")).expect("mkdir");
        fs::write(temp.path().join("prompts/build.md"), "build it").expect("write");
        let stage: StageConfig =
            toml::from_str("name = \"build\"\nprompt = \"prompts/build.md\"\n").expect("parse");
        assert_eq!(stage.task_text(temp.path()).expect("task"), "build it");
    }
}
