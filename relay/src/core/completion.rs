//! Completion-marker detection over the progress record.
//!
//! Only a `STATUS:` line counts. Prose that merely mentions the marker
//! ("once we reach COMPLETE ...") must never end a relay.

use std::sync::LazyLock;

use regex::Regex;

/// Universal "fully complete" sentinel accepted in addition to the configured marker.
pub const COMPLETE_SENTINEL: &str = "COMPLETE";

static STATUS_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[ \t>#*_\-]*STATUS[*_]*[ \t]*:[ \t]*(.*)$").expect("status line regex")
});

/// Value of the first `STATUS:` line, with markdown emphasis stripped.
pub fn status_value(progress: &str) -> Option<String> {
    let caps = STATUS_LINE_RE.captures(progress)?;
    let raw = caps.get(1)?.as_str();
    let value = raw
        .trim()
        .trim_matches(|c: char| matches!(c, '*' | '_' | '`'))
        .trim();
    Some(value.to_string())
}

/// True if the progress record's status line declares `marker` or the universal sentinel.
pub fn is_complete(progress: &str, marker: &str) -> bool {
    let Some(value) = status_value(progress) else {
        return false;
    };
    value_matches(&value, marker) || value_matches(&value, COMPLETE_SENTINEL)
}

/// Case-insensitive prefix match that stops at a word boundary.
fn value_matches(value: &str, marker: &str) -> bool {
    let marker = marker.trim();
    if marker.is_empty() {
        return false;
    }
    let value = value.to_ascii_uppercase();
    let marker = marker.to_ascii_uppercase();
    let Some(rest) = value.strip_prefix(&marker) else {
        return false;
    };
    match rest.chars().next() {
        None => true,
        Some(c) => !(c.is_alphanumeric() || c == '_'),
    }
}
