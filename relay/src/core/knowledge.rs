//! Knowledge-base section handling.
//!
//! The knowledge file has a durable core section and a rolling session log.
//! Compaction trims the log to the newest entries and leaves everything else
//! byte-for-byte intact. If either heading cannot be found the text is returned
//! unchanged.

pub const CORE_HEADING: &str = "## Core Knowledge";
pub const LOG_HEADING: &str = "## Session Log";
const ENTRY_PREFIX: &str = "### ";

/// Boilerplate written when a relay or stage is initialized.
pub const KNOWLEDGE_TEMPLATE: &str = "# Knowledge Base\n\n\
## Core Knowledge\n\n\
<!-- Durable facts every future session needs. Never pruned. -->\n\n\
## Session Log\n\n\
<!-- One `### Session N` entry per session. Only the newest entries are kept. -->\n";

/// Byte range of a `## ` section body: from the line after the heading to the next `## ` heading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Section {
    body_start: usize,
    end: usize,
}

/// Return `text` with the session log trimmed to the newest `keep` entries.
///
/// The second value is the number of entries removed.
pub fn compact(text: &str, keep: usize) -> (String, usize) {
    if find_section(text, CORE_HEADING).is_none() {
        return (text.to_string(), 0);
    }
    let Some(log) = find_section(text, LOG_HEADING) else {
        return (text.to_string(), 0);
    };

    let body = &text[log.body_start..log.end];
    let starts = entry_starts(body);
    if starts.len() <= keep {
        return (text.to_string(), 0);
    }
    let removed = starts.len() - keep;
    let first_entry = starts[0];
    let first_kept = if keep == 0 { body.len() } else { starts[removed] };

    let mut out = String::with_capacity(text.len());
    out.push_str(&text[..log.body_start]);
    out.push_str(&body[..first_entry]);
    out.push_str(&body[first_kept..]);
    out.push_str(&text[log.end..]);
    (out, removed)
}

/// Number of entries currently in the session log, if the log heading exists.
pub fn log_entry_count(text: &str) -> Option<usize> {
    let log = find_section(text, LOG_HEADING)?;
    Some(entry_starts(&text[log.body_start..log.end]).len())
}

/// Body of the core section, trimmed, with HTML comments removed.
pub fn core_section(text: &str) -> Option<String> {
    let core = find_section(text, CORE_HEADING)?;
    let body = strip_comments(&text[core.body_start..core.end]);
    Some(body.trim().to_string())
}

/// Append a session-log entry. Falls back to appending at the end if the log heading is missing.
pub fn append_log_entry(text: &str, title: &str, body: &str) -> String {
    let entry = format!("{ENTRY_PREFIX}{}\n\n{}\n\n", title.trim(), body.trim());
    match find_section(text, LOG_HEADING) {
        Some(log) => {
            let mut out = String::with_capacity(text.len() + entry.len());
            let head = &text[..log.end];
            out.push_str(head);
            if !head.ends_with("\n\n") {
                out.push_str(if head.ends_with('\n') { "\n" } else { "\n\n" });
            }
            out.push_str(&entry);
            out.push_str(&text[log.end..]);
            out
        }
        None => {
            let mut out = text.trim_end().to_string();
            out.push_str("\n\n");
            out.push_str(&entry);
            out
        }
    }
}

/// Heading written at the top of a new shared knowledge file.
pub const SHARED_HEADER: &str = "# Shared Knowledge\n\n";

fn stage_begin(stage: &str) -> String {
    format!("<!-- stage:{stage} begin -->")
}

fn stage_end(stage: &str) -> String {
    format!("<!-- stage:{stage} end -->")
}

/// Insert or replace the namespaced block for `stage` in the shared knowledge text.
///
/// Blocks of other stages are left untouched; a replaced block keeps its position.
pub fn upsert_stage_block(text: &str, stage: &str, core: &str) -> String {
    let begin = stage_begin(stage);
    let end = stage_end(stage);
    let block = format!("{begin}\n## Stage: {stage}\n\n{}\n{end}\n", core.trim());

    if let Some(start) = text.find(&begin)
        && let Some(rel_end) = text[start..].find(&end)
    {
        let mut stop = start + rel_end + end.len();
        if text[stop..].starts_with('\n') {
            stop += 1;
        }
        let mut out = String::with_capacity(text.len() + block.len());
        out.push_str(&text[..start]);
        out.push_str(&block);
        out.push_str(&text[stop..]);
        return out;
    }

    let mut out = if text.trim().is_empty() {
        SHARED_HEADER.to_string()
    } else {
        let mut head = text.trim_end().to_string();
        head.push_str("\n\n");
        head
    };
    out.push_str(&block);
    out
}

/// Number of blocks recorded for `stage`.
pub fn stage_block_count(text: &str, stage: &str) -> usize {
    text.matches(&stage_begin(stage)).count()
}

fn find_section(text: &str, heading: &str) -> Option<Section> {
    let mut offset = 0;
    let mut body_start: Option<usize> = None;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_end();
        if let Some(start) = body_start {
            if is_level_two_heading(trimmed) {
                return Some(Section {
                    body_start: start,
                    end: offset,
                });
            }
        } else if trimmed.eq_ignore_ascii_case(heading) {
            body_start = Some(offset + line.len());
        }
        offset += line.len();
    }
    body_start.map(|start| Section {
        body_start: start,
        end: text.len(),
    })
}

fn is_level_two_heading(line: &str) -> bool {
    line.starts_with("## ") || line == "##"
}

fn entry_starts(body: &str) -> Vec<usize> {
    let mut starts = Vec::new();
    let mut offset = 0;
    for line in body.split_inclusive('\n') {
        if line.starts_with(ENTRY_PREFIX) {
            starts.push(offset);
        }
        offset += line.len();
    }
    starts
}

fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<!--") {
        out.push_str(&rest[..start]);
        match rest[start..].find("-->") {
            Some(end) => rest = &rest[start + end + 3..],
            None => {
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}
