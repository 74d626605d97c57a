//! History window
//!
//! When a transcript grows past `agent.max_context_chars`, the model sees
//! the most recent entries verbatim and everything older folded into one
//! summary note. The stored transcript is never rewritten.

use super::conversation::{Role, TranscriptEntry};

const SUMMARY_HEADER: &str = "[Conversation History Summary]";
const MAX_REQUESTS: usize = 5;
const MAX_ERRORS: usize = 3;
const REQUEST_PREVIEW_CHARS: usize = 150;
const ERROR_PREVIEW_CHARS: usize = 100;
/// Longer execution entries are output, not error reports
const ERROR_ENTRY_MAX_CHARS: usize = 500;

/// Older entries replaced by `summary`; entries from `keep_from` on stay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compacted {
    pub summary: String,
    pub keep_from: usize,
}

/// `None` when the transcript fits or there is nothing old enough to fold.
/// A `max_chars` of 0 disables the window.
pub fn compact(entries: &[TranscriptEntry], max_chars: usize, keep_recent: usize) -> Option<Compacted> {
    if max_chars == 0 || entries.len() <= keep_recent {
        return None;
    }
    let total: usize = entries.iter().map(|e| e.content.chars().count()).sum();
    if total <= max_chars {
        return None;
    }

    // the kept tail may not open with execution output
    let mut keep_from = entries.len() - keep_recent;
    while keep_from > 0 && entries[keep_from].role == Role::Execution {
        keep_from -= 1;
    }
    if keep_from == 0 {
        return None;
    }

    Some(Compacted {
        summary: summarize(&entries[..keep_from]),
        keep_from,
    })
}

fn summarize(entries: &[TranscriptEntry]) -> String {
    let requests: Vec<&str> = entries
        .iter()
        .filter(|e| e.role == Role::User)
        .map(|e| e.content.as_str())
        .collect();
    let executions = entries.iter().filter(|e| e.role == Role::Execution).count();
    let errors: Vec<&str> = entries
        .iter()
        .filter(|e| e.role == Role::Execution && looks_like_error(&e.content))
        .map(|e| e.content.as_str())
        .collect();

    let mut lines = vec![SUMMARY_HEADER.to_string(), String::new()];
    if !requests.is_empty() {
        lines.push("User requests:".to_string());
        for request in requests.iter().skip(requests.len().saturating_sub(MAX_REQUESTS)) {
            lines.push(format!("  - {}", preview(request, REQUEST_PREVIEW_CHARS)));
        }
    }
    if executions > 0 {
        lines.push(format!("Code blocks executed: {executions}"));
    }
    if !errors.is_empty() {
        lines.push("Errors:".to_string());
        for error in errors.iter().skip(errors.len().saturating_sub(MAX_ERRORS)) {
            lines.push(format!("  - {}", preview(error, ERROR_PREVIEW_CHARS)));
        }
    }
    lines.push(String::new());
    lines.push("---".to_string());
    lines.push(format!(
        "(Previous {} messages have been compacted into this summary)",
        entries.len()
    ));
    lines.join("\n")
}

fn looks_like_error(content: &str) -> bool {
    if content.chars().count() >= ERROR_ENTRY_MAX_CHARS {
        return false;
    }
    let lower = content.to_lowercase();
    lower.contains("error") || lower.contains("exception")
}

fn preview(text: &str, max_chars: usize) -> String {
    let single_line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if single_line.chars().count() <= max_chars {
        single_line
    } else {
        let mut cut: String = single_line.chars().take(max_chars).collect();
        cut.push_str("...");
        cut
    }
}
