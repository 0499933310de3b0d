//! Rate-limit signature detection and backoff computation.

use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveTime, TimeZone, Utc};
use regex::Regex;

static SIGNATURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(usage limit reached|rate[ _-]?limit(?:ed|_error| reached| exceeded)|too many requests|(?:status|error|http)[ :]*429)",
    )
    .expect("rate limit signature regex")
});

/// Line-anchored signatures for agent-written records, where prose about rate
/// limiting is ordinary content.
static RECORD_SIGNATURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?im)^[ \t>#*_\-]*(STATUS[*_]*[ \t]*:[ \t]*[*_]*RATE[ _-]?LIMITED\b.*|(?:Claude AI )?usage limit reached\b.*)$",
    )
    .expect("record signature regex")
});

static EPOCH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)limit reached\|(\d{9,11})").expect("epoch regex"));

static RETRY_AFTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)retry[ _-]?after[\s:=]+(\d+)\s*(seconds?|secs?|s|minutes?|mins?|m)?\b")
        .expect("retry-after regex")
});

static CLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)resets?\s+(?:at\s+)?(\d{1,2})(?::(\d{2}))?\s*(am|pm)\b").expect("clock regex")
});

/// A detected throttling signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitSignal {
    /// The matched signature text.
    pub reason: String,
    /// Explicit reset time, when the message carried one.
    pub resets_at: Option<DateTime<Utc>>,
}

/// Scan `text` for a rate-limit signature. `now` anchors relative reset times.
pub fn detect(text: &str, now: DateTime<Utc>) -> Option<RateLimitSignal> {
    let found = SIGNATURE_RE.find(text)?;
    Some(RateLimitSignal {
        reason: found.as_str().to_string(),
        resets_at: parse_reset(text, now),
    })
}

/// Scan an agent-written record (the progress file). Only a line that starts
/// with `STATUS: RATE_LIMITED` or a usage-limit notice counts.
pub fn detect_in_record(text: &str, now: DateTime<Utc>) -> Option<RateLimitSignal> {
    let line = RECORD_SIGNATURE_RE.captures(text)?.get(1)?;
    Some(RateLimitSignal {
        reason: line.as_str().trim().to_string(),
        resets_at: parse_reset(text, now),
    })
}

/// Extract a reset time from the message: epoch suffix, `retry after N`, or `resets 3pm`.
pub fn parse_reset(text: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if let Some(caps) = EPOCH_RE.captures(text)
        && let Ok(secs) = caps[1].parse::<i64>()
        && let Some(at) = DateTime::<Utc>::from_timestamp(secs, 0)
    {
        return Some(at);
    }

    if let Some(caps) = RETRY_AFTER_RE.captures(text)
        && let Ok(amount) = caps[1].parse::<i64>()
    {
        let unit = caps.get(2).map(|m| m.as_str().to_ascii_lowercase());
        let secs = match unit.as_deref() {
            Some(u) if u.starts_with('m') => amount.saturating_mul(60),
            _ => amount,
        };
        return chrono::Duration::try_seconds(secs).and_then(|delta| now.checked_add_signed(delta));
    }

    if let Some(caps) = CLOCK_RE.captures(text) {
        let hour: u32 = caps[1].parse().ok()?;
        let minute: u32 = caps.get(2).map_or(Some(0), |m| m.as_str().parse().ok())?;
        let pm = caps[3].eq_ignore_ascii_case("pm");
        return next_local_clock(hour, minute, pm, now);
    }

    None
}

/// When to resume after a signal: the explicit reset if known, else the default backoff,
/// never further out than `max_wait`.
pub fn resume_at(
    signal: &RateLimitSignal,
    now: DateTime<Utc>,
    default_backoff: Duration,
    max_wait: Duration,
) -> DateTime<Utc> {
    let cap = offset(now, max_wait);
    let target = match signal.resets_at {
        Some(at) if at > now => at,
        _ => offset(now, default_backoff),
    };
    target.min(cap)
}

fn next_local_clock(hour: u32, minute: u32, pm: bool, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if hour == 0 || hour > 12 || minute > 59 {
        return None;
    }
    let hour24 = match (hour, pm) {
        (12, false) => 0,
        (12, true) => 12,
        (h, false) => h,
        (h, true) => h + 12,
    };
    let clock = NaiveTime::from_hms_opt(hour24, minute, 0)?;
    let local_now = now.with_timezone(&Local);
    let mut date = local_now.date_naive();
    for _ in 0..2 {
        let candidate = Local
            .from_local_datetime(&date.and_time(clock))
            .earliest()?
            .with_timezone(&Utc);
        if candidate > now {
            return Some(candidate);
        }
        date = date.succ_opt()?;
    }
    None
}

fn offset(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
