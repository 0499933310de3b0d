//! Session prompt construction.
//!
//! The template marks each section with `<!-- section:KEY required|droppable -->`.
//! When the rendered prompt exceeds the byte budget, droppable sections are
//! removed in a fixed order and then the last section is truncated.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::core::knowledge;
use crate::io::paths::RelayPaths;
use crate::io::state_store::read_or_empty;

const SESSION_TEMPLATE: &str = include_str!("prompts/session.md");

static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").expect("section marker regex")
});

/// Drop order when over budget: least useful first.
const DROP_ORDER: [&str; 3] = ["shared", "progress", "knowledge"];

/// File locations and thresholds named in the injected protocol block.
#[derive(Debug, Clone, Serialize)]
pub struct ProtocolContext {
    pub progress_path: String,
    pub next_task_path: String,
    pub knowledge_path: String,
    pub handoff_ready_path: String,
    pub completion_marker: String,
    pub warn_percent: u8,
    pub handoff_percent: u8,
}

impl ProtocolContext {
    pub fn new(paths: &RelayPaths, completion_marker: &str, warn_percent: u8, handoff_percent: u8) -> Self {
        let show = |p: &Path| display_relative(&paths.workdir, p);
        Self {
            progress_path: show(&paths.progress),
            next_task_path: show(&paths.next_task),
            knowledge_path: show(&paths.knowledge),
            handoff_ready_path: show(&paths.handoff_ready),
            completion_marker: completion_marker.to_string(),
            warn_percent,
            handoff_percent,
        }
    }
}

/// Everything a session prompt is built from.
#[derive(Debug, Clone)]
pub struct PromptInputs {
    pub session: u32,
    pub max_sessions: u32,
    pub stage: Option<String>,
    pub task: String,
    pub progress: String,
    pub next_task: String,
    /// Core section of the knowledge base only; the rolling log stays on disk.
    pub core_knowledge: String,
    pub shared_path: Option<PathBuf>,
    pub shared_text: String,
    pub protocol: Option<ProtocolContext>,
}

impl PromptInputs {
    /// Load the per-session inputs from the relay's state files.
    pub fn load(
        paths: &RelayPaths,
        session: u32,
        max_sessions: u32,
        task: String,
        shared_path: Option<&Path>,
    ) -> Result<Self> {
        let knowledge_text = read_or_empty(&paths.knowledge)?;
        let shared_text = match shared_path {
            Some(path) => read_or_empty(path)?,
            None => String::new(),
        };
        Ok(Self {
            session,
            max_sessions,
            stage: None,
            task,
            progress: read_or_empty(&paths.progress)?,
            next_task: read_or_empty(&paths.next_task)?,
            core_knowledge: knowledge::core_section(&knowledge_text).unwrap_or_default(),
            shared_path: shared_path.map(Path::to_path_buf),
            shared_text,
            protocol: None,
        })
    }
}

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

/// Render the session prompt within `budget_bytes`.
pub fn build_prompt(inputs: &PromptInputs, budget_bytes: usize) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("session", SESSION_TEMPLATE)
        .context("load session template")?;
    let template = env.get_template("session").context("get session template")?;
    let non_empty = |s: &str| {
        let t = s.trim();
        (!t.is_empty()).then(|| t.to_string())
    };
    let rendered = template
        .render(context! {
            protocol => &inputs.protocol,
            session => inputs.session,
            max_sessions => inputs.max_sessions,
            stage => &inputs.stage,
            task => inputs.task.trim(),
            next_task => non_empty(&inputs.next_task),
            core_knowledge => non_empty(&inputs.core_knowledge),
            progress => non_empty(&inputs.progress),
            shared_path => inputs.shared_path.as_ref().map(|p| p.display().to_string()),
            shared_text => non_empty(&inputs.shared_text),
        })
        .context("render session template")?;

    let mut sections = parse_sections(&rendered);
    apply_budget(&mut sections, budget_bytes);
    Ok(render_sections(&sections))
}

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    let markers: Vec<_> = SECTION_RE.captures_iter(rendered).collect();
    let mut sections = Vec::new();
    for (i, caps) in markers.iter().enumerate() {
        let (Some(whole), Some(key), Some(kind)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let end = markers
            .get(i + 1)
            .and_then(|next| next.get(0))
            .map_or(rendered.len(), |m| m.start());
        let content = rendered[whole.end()..end].trim().to_string();
        if content.is_empty() {
            continue;
        }
        sections.push(ParsedSection {
            key: key.as_str().to_string(),
            required: kind.as_str() == "required",
            content,
        });
    }
    sections
}

fn apply_budget(sections: &mut Vec<ParsedSection>, budget: usize) {
    let total = |secs: &[ParsedSection]| -> usize { secs.iter().map(|s| s.content.len()).sum() };

    for key in DROP_ORDER {
        if total(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped prompt section for budget"
            );
            sections.remove(idx);
        }
    }

    if total(sections) <= budget {
        return;
    }
    let Some((last, rest)) = sections.split_last_mut() else {
        return;
    };
    let allowed = budget.saturating_sub(rest.iter().map(|s| s.content.len()).sum());
    let before = last.content.len();
    let cut = floor_char_boundary(&last.content, allowed.saturating_sub(12));
    last.content.truncate(cut);
    last.content.push_str("\n[truncated]");
    debug!(section = %last.key, before, after = last.content.len(), "truncated prompt section");
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    (0..=index).rev().find(|i| s.is_char_boundary(*i)).unwrap_or(0)
}

fn render_sections(sections: &[ParsedSection]) -> String {
    let mut out = sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n");
    out.push('\n');
    out
}

fn display_relative(base: &Path, path: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .display()
        .to_string()
}
