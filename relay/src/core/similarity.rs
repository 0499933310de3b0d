//! Textual loop detection between consecutive next-task records.

use std::collections::HashSet;

/// Line overlap at or above this ratio flags a loop.
pub const LOOP_THRESHOLD: f64 = 0.85;
/// Texts whose lengths differ by more than this fraction are never a loop.
pub const MAX_LENGTH_DELTA: f64 = 0.20;
/// Consecutive loop flags that stop a relay.
pub const LOOP_STRIKES: u32 = 3;

/// Result of comparing two next-task texts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopCheck {
    pub is_loop: bool,
    pub similarity: f64,
}

impl LoopCheck {
    fn clear(similarity: f64) -> Self {
        Self {
            is_loop: false,
            similarity,
        }
    }
}

/// Compare the current next-task text with the previous session's archived copy.
///
/// `sessions_run` is the number of sessions completed so far; fewer than two
/// means there is nothing meaningful to compare.
pub fn detect_loop(previous: &str, current: &str, sessions_run: u32) -> LoopCheck {
    if sessions_run < 2 {
        return LoopCheck::clear(0.0);
    }

    let prev_len = previous.trim().chars().count();
    let cur_len = current.trim().chars().count();
    let longest = prev_len.max(cur_len);
    if longest == 0 {
        return LoopCheck::clear(0.0);
    }
    let delta = prev_len.abs_diff(cur_len) as f64 / longest as f64;
    if delta > MAX_LENGTH_DELTA {
        return LoopCheck::clear(0.0);
    }

    let similarity = line_similarity(previous, current);
    LoopCheck {
        is_loop: similarity >= LOOP_THRESHOLD,
        similarity,
    }
}

/// Fraction of non-blank lines in `newer` found verbatim in `older`, over the larger line count.
pub fn line_similarity(older: &str, newer: &str) -> f64 {
    let old_lines = non_blank_lines(older);
    let new_lines = non_blank_lines(newer);
    let denominator = old_lines.len().max(new_lines.len());
    if denominator == 0 {
        return 0.0;
    }
    let old_set: HashSet<&str> = old_lines.iter().copied().collect();
    let shared = new_lines
        .iter()
        .filter(|line| old_set.contains(*line))
        .count();
    shared as f64 / denominator as f64
}

fn non_blank_lines(text: &str) -> Vec<&str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect()
}
