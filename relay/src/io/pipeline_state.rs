//! Persisted pipeline state (`pipeline/pipeline_state.json`).

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::types::StageStatus;
use crate::io::config::PipelineConfig;
use crate::io::state_store::write_atomic;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineState {
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Stage currently running, if any.
    pub current_stage: Option<String>,
    pub stages: BTreeMap<String, StageStatus>,
    /// Retries consumed per stage.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub retries: BTreeMap<String, u32>,
}

impl PipelineState {
    /// Fresh state with every configured stage pending.
    pub fn new(config: &PipelineConfig, now: DateTime<Utc>) -> Self {
        Self {
            name: config.name.clone(),
            started_at: now,
            updated_at: now,
            current_stage: None,
            stages: config
                .stages
                .iter()
                .map(|s| (s.name.clone(), StageStatus::Pending))
                .collect(),
            retries: BTreeMap::new(),
        }
    }

    /// Bring a loaded state in line with the current config: add new stages as
    /// pending and drop stages no longer configured.
    pub fn reconcile(&mut self, config: &PipelineConfig) {
        self.name = config.name.clone();
        self.stages
            .retain(|name, _| config.stages.iter().any(|s| &s.name == name));
        self.retries
            .retain(|name, _| config.stages.iter().any(|s| &s.name == name));
        for stage in &config.stages {
            self.stages
                .entry(stage.name.clone())
                .or_insert(StageStatus::Pending);
        }
        if let Some(current) = &self.current_stage
            && !self.stages.contains_key(current)
        {
            self.current_stage = None;
        }
    }

    pub fn status(&self, stage: &str) -> StageStatus {
        self.stages
            .get(stage)
            .copied()
            .unwrap_or(StageStatus::Pending)
    }

    pub fn set_status(&mut self, stage: &str, status: StageStatus, now: DateTime<Utc>) {
        self.stages.insert(stage.to_string(), status);
        self.current_stage = (status == StageStatus::InProgress).then(|| stage.to_string());
        self.updated_at = now;
    }

    pub fn retries_used(&self, stage: &str) -> u32 {
        self.retries.get(stage).copied().unwrap_or(0)
    }

    pub fn record_retry(&mut self, stage: &str) -> u32 {
        let used = self.retries.entry(stage.to_string()).or_insert(0);
        *used += 1;
        *used
    }
}

/// `None` when no pipeline state has been written yet.
pub fn load_pipeline_state(path: &Path) -> Result<Option<PipelineState>> {
    debug!(path = %path.display(), "loading pipeline state");
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("read pipeline state {}", path.display()));
        }
    };
    let state = serde_json::from_str(&contents)
        .with_context(|| format!("parse pipeline state {}", path.display()))?;
    Ok(Some(state))
}

/// Atomically write pipeline state to disk (temp file + rename).
pub fn write_pipeline_state(path: &Path, state: &PipelineState) -> Result<()> {
    debug!(path = %path.display(), current = ?state.current_stage, "writing pipeline state");
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    write_atomic(path, &buf)
}
