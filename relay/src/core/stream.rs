//! Event model for the streamed launch strategy.
//!
//! Print-mode agents emit one JSON object per line. Events are decoded into a
//! closed set of variants; any unrecognized `type` lands in
//! [`StreamEvent::Unknown`] instead of failing the stream.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::core::rate_limit::{self, RateLimitSignal};

/// One decoded line of the agent's event stream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    System {
        #[serde(default)]
        subtype: Option<String>,
    },
    Assistant {
        #[serde(default)]
        message: AssistantMessage,
    },
    ToolUse {
        #[serde(default)]
        name: Option<String>,
    },
    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        result: Option<String>,
    },
    RateLimitEvent {
        #[serde(default)]
        status: Option<String>,
        #[serde(default, alias = "resetsAt")]
        resets_at: Option<i64>,
        #[serde(default)]
        rate_limit_info: Option<RateLimitInfo>,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        error: Option<Value>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default)]
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RateLimitInfo {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, alias = "resetsAt")]
    pub resets_at: Option<i64>,
}

/// Decode one stream line. Blank lines and non-JSON noise yield `None`.
pub fn parse_line(line: &str) -> Option<StreamEvent> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// Running summary of a session's event stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamTally {
    pub events: u32,
    pub tool_uses: u32,
    pub last_tool: Option<String>,
    pub last_text: Option<String>,
    pub rate_limit: Option<RateLimitSignal>,
    pub errors: Vec<String>,
}

impl StreamTally {
    /// Fold one event into the tally.
    pub fn observe(&mut self, event: &StreamEvent, now: DateTime<Utc>) {
        self.events += 1;
        match event {
            StreamEvent::Assistant { message } => {
                for block in &message.content {
                    match block {
                        ContentBlock::ToolUse { name } => self.record_tool(name),
                        ContentBlock::Text { text } if !text.trim().is_empty() => {
                            self.last_text = Some(text.clone());
                        }
                        _ => {}
                    }
                }
            }
            StreamEvent::ToolUse { name } => {
                self.record_tool(name.as_deref().unwrap_or("unknown"));
            }
            StreamEvent::Result {
                is_error, result, ..
            } => {
                if let Some(text) = result {
                    if let Some(signal) = rate_limit::detect(text, now) {
                        self.rate_limit = Some(signal);
                    } else if *is_error {
                        self.errors.push(text.clone());
                    }
                }
            }
            StreamEvent::RateLimitEvent {
                status,
                resets_at,
                rate_limit_info,
            } => {
                let info = rate_limit_info.clone().unwrap_or_default();
                let status = status.clone().or(info.status);
                if is_allowed(status.as_deref()) {
                    return;
                }
                let resets_at = resets_at
                    .or(info.resets_at)
                    .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));
                self.rate_limit = Some(RateLimitSignal {
                    reason: format!(
                        "rate_limit_event ({})",
                        status.as_deref().unwrap_or("limited")
                    ),
                    resets_at,
                });
            }
            StreamEvent::Error { message, error } => {
                let text = message
                    .clone()
                    .or_else(|| error.as_ref().map(Value::to_string))
                    .unwrap_or_else(|| "unknown error".to_string());
                if let Some(signal) = rate_limit::detect(&text, now) {
                    self.rate_limit = Some(signal);
                }
                self.errors.push(text);
            }
            StreamEvent::System { .. } | StreamEvent::Unknown => {}
        }
    }

    fn record_tool(&mut self, name: &str) {
        self.tool_uses += 1;
        self.last_tool = Some(name.to_string());
    }
}

/// `allowed`-style statuses are informational quota updates, not throttling.
fn is_allowed(status: Option<&str>) -> bool {
    status.is_some_and(|s| s.to_ascii_lowercase().starts_with("allowed"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).expect("timestamp")
    }

    #[test]
    fn parses_assistant_tool_use_blocks() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Reading"},{"type":"tool_use","id":"t1","name":"Read","input":{}}]}}"#;
        let event = parse_line(line).expect("event");
        let mut tally = StreamTally::default();
        tally.observe(&event, now());
        assert_eq!(tally.tool_uses, 1);
        assert_eq!(tally.last_tool.as_deref(), Some("Read"));
        assert_eq!(tally.last_text.as_deref(), Some("Reading"));
    }

    #[test]
    fn unknown_types_fall_through() {
        let event = parse_line(r#"{"type":"user","message":{}}"#).expect("event");
        assert_eq!(event, StreamEvent::Unknown);
    }

    #[test]
    fn non_json_lines_are_skipped() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("warning: something"), None);
        assert_eq!(parse_line("{not json"), None);
    }

    #[test]
    fn rate_limit_event_records_reset() {
        let event = parse_line(
            r#"{"type":"rate_limit_event","rate_limit_info":{"status":"rejected","resetsAt":1700003600}}"#,
        )
        .expect("event");
        let mut tally = StreamTally::default();
        tally.observe(&event, now());
        let signal = tally.rate_limit.expect("signal");
        assert_eq!(signal.resets_at.map(|t| t.timestamp()), Some(1_700_003_600));
    }

    #[test]
    fn allowed_rate_limit_event_is_informational() {
        let event = parse_line(r#"{"type":"rate_limit_event","status":"allowed_warning"}"#)
            .expect("event");
        let mut tally = StreamTally::default();
        tally.observe(&event, now());
        assert!(tally.rate_limit.is_none());
    }

    #[test]
    fn result_with_limit_text_is_rate_limited() {
        let event = parse_line(
            r#"{"type":"result","subtype":"error","is_error":true,"result":"Claude AI usage limit reached|1700003600"}"#,
        )
        .expect("event");
        let mut tally = StreamTally::default();
        tally.observe(&event, now());
        assert!(tally.rate_limit.is_some());
        assert!(tally.errors.is_empty());
    }

    #[test]
    fn error_event_is_recorded() {
        let event = parse_line(r#"{"type":"error","error":{"kind":"boom"}}"#).expect("event");
        let mut tally = StreamTally::default();
        tally.observe(&event, now());
        assert_eq!(tally.errors.len(), 1);
        assert!(tally.errors[0].contains("boom"));
    }
}
