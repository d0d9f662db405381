//! Transcript summary parsing (§4.6.1). The agent runtime writes an
//! append-only JSONL transcript; this module sums token usage and cost
//! and detects whether the run errored. Never raises: a missing file
//! yields zeros, and a bad line is skipped silently.

use std::path::{Path, PathBuf};

use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TranscriptSummary {
    pub tokens: u64,
    pub cost_usd: f64,
    pub had_error: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum TranscriptPathError {
    #[error("unsafe path segment: {0}")]
    UnsafeSegment(String),
}

/// Rejects path segments containing `/`, `\`, a NUL byte, or `..`/`.`.
/// Applies to both `agentId` and `sessionId`, since both are interpolated
/// into a filesystem path.
pub fn validate_path_segment(segment: &str) -> Result<(), TranscriptPathError> {
    let unsafe_chars = ['/', '\\', '\0'];
    if segment.is_empty()
        || segment == ".."
        || segment == "."
        || segment.chars().any(|c| unsafe_chars.contains(&c))
    {
        return Err(TranscriptPathError::UnsafeSegment(segment.to_string()));
    }
    Ok(())
}

/// Builds `$HOME/.openclaw/agents/<agentId>/sessions/<sessionId>.jsonl`,
/// validating both segments first.
pub fn transcript_path(
    home_dir: &Path,
    agent_id: &str,
    session_id: &str,
) -> Result<PathBuf, TranscriptPathError> {
    validate_path_segment(agent_id)?;
    validate_path_segment(session_id)?;
    Ok(home_dir
        .join(".openclaw")
        .join("agents")
        .join(agent_id)
        .join("sessions")
        .join(format!("{session_id}.jsonl")))
}

fn usage_tokens(usage: &Value) -> u64 {
    if let Some(total) = usage
        .get("totalTokens")
        .or_else(|| usage.get("total"))
        .and_then(|v| v.as_u64())
    {
        return total;
    }
    let input = usage.get("input").and_then(|v| v.as_u64()).unwrap_or(0);
    let output = usage.get("output").and_then(|v| v.as_u64()).unwrap_or(0);
    let cache_read = usage.get("cacheRead").and_then(|v| v.as_u64()).unwrap_or(0);
    let cache_write = usage.get("cacheWrite").and_then(|v| v.as_u64()).unwrap_or(0);
    input + output + cache_read + cache_write
}

/// Parses the JSONL content of a transcript (already read into memory) and
/// sums token usage, cost, and error state across every `type="message"`
/// event.
pub fn summarize_transcript_text(text: &str) -> TranscriptSummary {
    let mut summary = TranscriptSummary::default();
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(event) = serde_json::from_str::<Value>(trimmed) else {
            continue;
        };
        if event.get("type").and_then(|v| v.as_str()) != Some("message") {
            continue;
        }
        if let Some(usage) = event.get("message").and_then(|m| m.get("usage")) {
            summary.tokens += usage_tokens(usage);
            if let Some(cost) = usage
                .get("cost")
                .and_then(|c| c.get("total"))
                .and_then(|v| v.as_f64())
            {
                summary.cost_usd += cost;
            }
        }
        let stop_reason_error = event.get("stopReason").and_then(|v| v.as_str()) == Some("error");
        let has_error_message = event
            .get("errorMessage")
            .and_then(|v| v.as_str())
            .map(|s| !s.is_empty())
            .unwrap_or(false);
        if stop_reason_error || has_error_message {
            summary.had_error = true;
        }
    }
    summary
}

/// Reads and summarizes the transcript at `path`. Missing files produce an
/// all-zero summary rather than an error.
pub fn summarize_transcript_file(path: &Path) -> TranscriptSummary {
    match std::fs::read_to_string(path) {
        Ok(text) => summarize_transcript_text(&text),
        Err(_) => TranscriptSummary::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sums_tokens_and_cost_across_message_events() {
        let text = r#"
{"type":"message","message":{"usage":{"totalTokens":100,"cost":{"total":0.5}}}}
{"type":"message","message":{"usage":{"input":10,"output":20}}}
{"type":"other"}
"#;
        let summary = summarize_transcript_text(text);
        assert_eq!(summary.tokens, 130);
        assert_eq!(summary.cost_usd, 0.5);
        assert!(!summary.had_error);
    }

    #[test]
    fn detects_error_via_stop_reason_or_error_message() {
        let text = r#"{"type":"message","stopReason":"error"}"#;
        assert!(summarize_transcript_text(text).had_error);

        let text = r#"{"type":"message","errorMessage":"boom"}"#;
        assert!(summarize_transcript_text(text).had_error);
    }

    #[test]
    fn skips_unparseable_lines_silently() {
        let text = "not json\n{\"type\":\"message\",\"message\":{\"usage\":{\"totalTokens\":5}}}";
        let summary = summarize_transcript_text(text);
        assert_eq!(summary.tokens, 5);
    }

    #[test]
    fn missing_file_yields_zero_summary() {
        let summary = summarize_transcript_file(Path::new("/nonexistent/path/session.jsonl"));
        assert_eq!(summary, TranscriptSummary::default());
    }

    #[test]
    fn rejects_unsafe_path_segments() {
        assert!(validate_path_segment("valid-agent_1").is_ok());
        assert!(validate_path_segment("../etc").is_err());
        assert!(validate_path_segment("a/b").is_err());
        assert!(validate_path_segment("..").is_err());
    }
}
