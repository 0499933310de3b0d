//! Pipeline orchestration: run configured stages in declared order, each as
//! its own relay with stage-scoped state.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::core::knowledge;
use crate::core::types::{FailurePolicy, RelayStop, StageStatus};
use crate::error::RelayError;
use crate::io::config::{PipelineConfig, RelayConfig, StageConfig};
use crate::io::launcher::Launcher;
use crate::io::paths::PipelinePaths;
use crate::io::pipeline_state::{PipelineState, load_pipeline_state, write_pipeline_state};
use crate::io::shutdown::CancelFlag;
use crate::io::state_store::{StateStore, read_or_empty, write_atomic};
use crate::io::verify::Verifier;
use crate::relay::{RelayOptions, RelayOutcome, SessionEvent, run_relay};

/// Result of one stage within this invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageReport {
    pub name: String,
    pub status: StageStatus,
    /// Why the stage stopped, when it ran.
    pub stop: Option<RelayStop>,
    /// Unmet dependency or other reason it never ran.
    pub note: Option<String>,
}

/// Summary of a pipeline invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub name: String,
    pub stages: Vec<StageReport>,
    pub interrupted: bool,
    /// Stage that stopped the pipeline.
    pub halted_at: Option<String>,
}

impl PipelineOutcome {
    /// True when every stage finished complete or skipped.
    pub fn is_success(&self) -> bool {
        !self.interrupted
            && self.halted_at.is_none()
            && self
                .stages
                .iter()
                .all(|s| s.status.satisfies_dependency())
    }
}

/// Fixed inputs of a pipeline run.
pub struct PipelineRun<'a> {
    pub paths: &'a PipelinePaths,
    pub config: &'a PipelineConfig,
    /// Directory prompt paths in the config are relative to.
    pub base_dir: &'a Path,
    /// Relay settings stage overrides are applied on top of.
    pub base: &'a RelayConfig,
}

/// Run every stage, resuming from persisted pipeline state.
///
/// The graph is validated before anything runs; configuration errors come back
/// as typed [`RelayError`]s inside the `anyhow::Error`.
#[instrument(skip_all, fields(pipeline = %run.config.name))]
pub fn run_pipeline<L, V, F>(
    run: &PipelineRun<'_>,
    launcher: &L,
    verifier: &V,
    cancel: &CancelFlag,
    mut on_session: F,
) -> Result<PipelineOutcome>
where
    L: Launcher + ?Sized,
    V: Verifier + ?Sized,
    F: FnMut(&str, &SessionEvent),
{
    let config = run.config;
    config.validate()?;
    run.paths.ensure_dirs()?;

    let mut state = match load_pipeline_state(&run.paths.state_file)? {
        Some(mut state) => {
            info!(current = ?state.current_stage, "resuming pipeline");
            state.reconcile(config);
            state
        }
        None => PipelineState::new(config, Utc::now()),
    };
    write_pipeline_state(&run.paths.state_file, &state)?;

    let shares = config.stages.iter().any(|s| s.share_knowledge);
    let mut outcome = PipelineOutcome {
        name: config.name.clone(),
        stages: Vec::new(),
        interrupted: false,
        halted_at: None,
    };

    for stage in &config.stages {
        if cancel.is_cancelled() {
            outcome.interrupted = true;
            break;
        }

        let prior = state.status(&stage.name);
        if prior.satisfies_dependency() {
            debug!(stage = %stage.name, status = ?prior, "stage already finished");
            outcome.stages.push(StageReport::untouched(&stage.name, prior));
            continue;
        }
        if stage.skip {
            info!(stage = %stage.name, "stage skipped by configuration");
            state.set_status(&stage.name, StageStatus::Skipped, Utc::now());
            write_pipeline_state(&run.paths.state_file, &state)?;
            outcome.stages.push(StageReport::untouched(&stage.name, StageStatus::Skipped));
            continue;
        }

        if let Some(err) = unmet_dependency(stage, &state) {
            warn!(%err, "stage cannot run");
            state.set_status(&stage.name, StageStatus::Failed, Utc::now());
            write_pipeline_state(&run.paths.state_file, &state)?;
            outcome.stages.push(StageReport {
                name: stage.name.clone(),
                status: StageStatus::Failed,
                stop: None,
                note: Some(err.to_string()),
            });
            if stage.on_failure == FailurePolicy::Skip {
                continue;
            }
            outcome.halted_at = Some(stage.name.clone());
            break;
        }

        let store = StateStore::new(run.paths.stage(&stage.name));
        if prior == StageStatus::Failed {
            info!(stage = %stage.name, "re-running previously failed stage from a clean slate");
            store.reset_for_retry()?;
            state.retries.remove(&stage.name);
        }

        let options = RelayOptions {
            paths: store.paths().clone(),
            config: stage.relay_config(run.base),
            task: stage.task_text(run.base_dir)?,
            stage: Some(stage.name.clone()),
            shared_knowledge: shares.then(|| run.paths.shared_knowledge.clone()),
        };

        let relay = loop {
            state.set_status(&stage.name, StageStatus::InProgress, Utc::now());
            write_pipeline_state(&run.paths.state_file, &state)?;
            info!(stage = %stage.name, "stage starting");

            let result = run_relay(&options, launcher, verifier, cancel, |event| {
                on_session(&stage.name, event);
            });
            let relay = match result {
                Ok(relay) => relay,
                Err(err) => {
                    error!(stage = %stage.name, err = %format!("{err:#}"), "stage relay failed");
                    state.set_status(&stage.name, StageStatus::Failed, Utc::now());
                    write_pipeline_state(&run.paths.state_file, &state)?;
                    return Err(err).with_context(|| format!("stage '{}'", stage.name));
                }
            };

            let can_retry = stage.on_failure == FailurePolicy::Retry
                && !relay.stop.is_success()
                && relay.stop != RelayStop::Interrupted
                && state.retries_used(&stage.name) < stage.max_retries;
            if !can_retry {
                break relay;
            }
            let used = state.record_retry(&stage.name);
            warn!(stage = %stage.name, stop = %relay.stop, retry = used, max = stage.max_retries, "retrying stage");
            store.reset_for_retry()?;
        };

        if relay.stop == RelayStop::Interrupted {
            info!(stage = %stage.name, "pipeline interrupted; stage stays in progress");
            outcome.stages.push(StageReport::ran(&stage.name, StageStatus::InProgress, &relay));
            outcome.interrupted = true;
            break;
        }

        if relay.stop.is_success() {
            state.set_status(&stage.name, StageStatus::Complete, Utc::now());
            write_pipeline_state(&run.paths.state_file, &state)?;
            info!(stage = %stage.name, stop = %relay.stop, "stage complete");
            if stage.share_knowledge {
                share_knowledge(run.paths, &store, &stage.name);
            }
            outcome.stages.push(StageReport::ran(&stage.name, StageStatus::Complete, &relay));
            continue;
        }

        state.set_status(&stage.name, StageStatus::Failed, Utc::now());
        write_pipeline_state(&run.paths.state_file, &state)?;
        warn!(stage = %stage.name, stop = %relay.stop, policy = ?stage.on_failure, "stage failed");
        outcome.stages.push(StageReport::ran(&stage.name, StageStatus::Failed, &relay));
        if stage.on_failure != FailurePolicy::Skip {
            outcome.halted_at = Some(stage.name.clone());
            break;
        }
    }

    info!(
        success = outcome.is_success(),
        interrupted = outcome.interrupted,
        halted_at = ?outcome.halted_at,
        "pipeline finished"
    );
    Ok(outcome)
}

impl StageReport {
    fn untouched(name: &str, status: StageStatus) -> Self {
        Self {
            name: name.to_string(),
            status,
            stop: None,
            note: None,
        }
    }

    fn ran(name: &str, status: StageStatus, relay: &RelayOutcome) -> Self {
        Self {
            name: name.to_string(),
            status,
            stop: Some(relay.stop.clone()),
            note: None,
        }
    }
}

fn unmet_dependency(stage: &StageConfig, state: &PipelineState) -> Option<RelayError> {
    stage.depends_on.iter().find_map(|dep| {
        let status = state.status(dep);
        (!status.satisfies_dependency()).then(|| RelayError::DependencyUnmet {
            stage: stage.name.clone(),
            dependency: dep.clone(),
            status: status.as_str().to_string(),
        })
    })
}

/// Copy the stage's core knowledge into the shared file. Failures only warn.
fn share_knowledge(paths: &PipelinePaths, store: &StateStore, stage: &str) {
    match write_shared_block(paths, store, stage) {
        Ok(true) => info!(stage, "shared core knowledge"),
        Ok(false) => debug!(stage, "no core knowledge to share"),
        Err(err) => warn!(stage, err = %format!("{err:#}"), "failed to share knowledge"),
    }
}

fn write_shared_block(paths: &PipelinePaths, store: &StateStore, stage: &str) -> Result<bool> {
    let text = store.read_knowledge()?;
    let Some(core) = knowledge::core_section(&text).filter(|c| !c.is_empty()) else {
        return Ok(false);
    };
    let shared = read_or_empty(&paths.shared_knowledge)?;
    write_atomic(
        &paths.shared_knowledge,
        &knowledge::upsert_stage_block(&shared, stage, &core),
    )?;
    Ok(true)
}
