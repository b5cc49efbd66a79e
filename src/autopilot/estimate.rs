//! Context usage estimation from the live transcript.
//!
//! The last assistant `usage` block after the most recent compaction boundary
//! is authoritative (`input + cache_read + cache_creation` is what the model
//! saw). Without one, characters since the boundary are divided by an average
//! characters-per-token figure.

use std::fmt;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::transcript::{self, message_from_record, Content, ContentBlock, Role};

/// Room the host's own compaction summary takes after a boundary.
pub const COMPACT_SUMMARY_TOKENS: u64 = 3000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EstimateMethod {
    ApiUsage,
    CharEstimate,
    PostCompactCharEstimate,
    None,
}

impl EstimateMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApiUsage => "api-usage",
            Self::CharEstimate => "char-estimate",
            Self::PostCompactCharEstimate => "post-compact-char-estimate",
            Self::None => "none",
        }
    }
}

impl fmt::Display for EstimateMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageEstimate {
    pub tokens: u64,
    /// Real user turns since the last boundary.
    pub turns: u32,
    pub method: EstimateMethod,
    /// Compaction boundaries seen in the whole transcript.
    pub boundaries: u32,
    /// Pre-compaction token figure of the last boundary, 0 if none.
    pub pre_compaction_tokens: u64,
}

impl UsageEstimate {
    pub fn empty() -> Self {
        Self {
            tokens: 0,
            turns: 0,
            method: EstimateMethod::None,
            boundaries: 0,
            pre_compaction_tokens: 0,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Usage {
    input_tokens: u64,
    cache_read_input_tokens: u64,
    cache_creation_input_tokens: u64,
}

impl Usage {
    fn total(&self) -> u64 {
        self.input_tokens + self.cache_read_input_tokens + self.cache_creation_input_tokens
    }
}

fn is_compact_boundary(record: &Value) -> bool {
    record.get("type").and_then(Value::as_str) == Some("system")
        && record.get("subtype").and_then(Value::as_str) == Some("compact_boundary")
}

fn boundary_pre_tokens(record: &Value) -> u64 {
    record
        .pointer("/compactMetadata/preTokens")
        .or_else(|| record.pointer("/compact_metadata/pre_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0)
}

/// Usage block of an assistant record, if it reports any tokens.
fn assistant_usage(record: &Value) -> Option<u64> {
    let msg = record.get("message").unwrap_or(record);
    let is_assistant = msg.get("role").and_then(Value::as_str) == Some("assistant")
        || record.get("type").and_then(Value::as_str) == Some("assistant");
    if !is_assistant {
        return None;
    }
    let usage: Usage = serde_json::from_value(msg.get("usage")?.clone()).ok()?;
    Some(usage.total()).filter(|t| *t > 0)
}

fn content_chars(content: &Content) -> usize {
    match content {
        Content::Text(s) => s.chars().count(),
        Content::Blocks(blocks) => blocks
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => text.chars().count(),
                ContentBlock::ToolUse { input, .. } if !input.is_null() => input.to_string().chars().count(),
                _ => 0,
            })
            .sum(),
    }
}

/// Estimate usage from already-parsed transcript records.
pub fn estimate_records(records: &[Value], chars_per_token: f64) -> UsageEstimate {
    let mut last_usage = 0u64;
    let mut turns = 0u32;
    let mut chars = 0usize;
    let mut boundaries = 0u32;
    let mut pre_tokens = 0u64;

    for record in records {
        if is_compact_boundary(record) {
            boundaries += 1;
            pre_tokens = boundary_pre_tokens(record);
            last_usage = 0;
            turns = 0;
            chars = 0;
            continue;
        }

        if let Some(total) = assistant_usage(record) {
            last_usage = total;
        }

        if let Some(message) = message_from_record(record) {
            if message.role == Role::User && !message.is_tool_result_echo() {
                turns += 1;
            }
            if let Some(content) = &message.content {
                chars += content_chars(content);
            }
        }
    }

    if last_usage > 0 {
        return UsageEstimate {
            tokens: last_usage,
            turns,
            method: EstimateMethod::ApiUsage,
            boundaries,
            pre_compaction_tokens: pre_tokens,
        };
    }

    let char_tokens = (chars as f64 / chars_per_token.max(0.1)).ceil() as u64;
    let (tokens, method) = if boundaries > 0 {
        (COMPACT_SUMMARY_TOKENS + char_tokens, EstimateMethod::PostCompactCharEstimate)
    } else {
        (char_tokens, EstimateMethod::CharEstimate)
    };
    UsageEstimate {
        tokens,
        turns,
        method,
        boundaries,
        pre_compaction_tokens: pre_tokens,
    }
}

/// Estimate usage for the transcript at `path`. A missing file estimates as
/// nothing at all.
pub fn estimate_transcript(path: &Path, chars_per_token: f64) -> Result<UsageEstimate> {
    if !path.exists() {
        return Ok(UsageEstimate::empty());
    }
    Ok(estimate_records(&transcript::read_records(path)?, chars_per_token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn api_usage_wins_and_sums_cache_figures() {
        let records = vec![
            json!({"type": "user", "message": {"role": "user", "content": "hi"}}),
            json!({"type": "assistant", "message": {"role": "assistant", "content": "yo",
                "usage": {"input_tokens": 100, "cache_read_input_tokens": 50_000, "cache_creation_input_tokens": 900}}}),
            json!({"type": "user", "message": {"role": "user", "content": "more"}}),
            json!({"type": "assistant", "message": {"role": "assistant", "content": "ok",
                "usage": {"input_tokens": 10, "cache_read_input_tokens": 60_000}}}),
        ];
        let est = estimate_records(&records, 3.5);
        assert_eq!(est.method, EstimateMethod::ApiUsage);
        assert_eq!(est.tokens, 60_010);
        assert_eq!(est.turns, 2);
    }

    #[test]
    fn zero_usage_does_not_replace_a_real_figure() {
        let records = vec![
            json!({"role": "assistant", "content": "a", "usage": {"input_tokens": 500}}),
            json!({"role": "assistant", "content": "b", "usage": {"input_tokens": 0}}),
        ];
        assert_eq!(estimate_records(&records, 3.5).tokens, 500);
    }

    #[test]
    fn char_fallback_counts_text_and_tool_inputs() {
        let records = vec![
            json!({"role": "user", "content": "1234567"}),
            json!({"role": "assistant", "content": [
                {"type": "text", "text": "abcdefg"},
                {"type": "tool_use", "name": "Read", "input": {"a": 1}}
            ]}),
            json!({"role": "user", "content": [{"type": "tool_result", "content": "ignored"}]}),
        ];
        let est = estimate_records(&records, 3.5);
        assert_eq!(est.method, EstimateMethod::CharEstimate);
        // 7 + 7 + len(r#"{"a":1}"#) = 21 chars → 6 tokens.
        assert_eq!(est.tokens, 6);
        assert_eq!(est.turns, 1);
    }

    #[test]
    fn boundary_resets_and_adds_summary_allowance() {
        let records = vec![
            json!({"role": "user", "content": "x".repeat(7000)}),
            json!({"role": "assistant", "content": "y", "usage": {"input_tokens": 150_000}}),
            json!({"type": "system", "subtype": "compact_boundary", "compactMetadata": {"preTokens": 155_000}}),
            json!({"role": "user", "content": "x".repeat(35)}),
        ];
        let est = estimate_records(&records, 3.5);
        assert_eq!(est.method, EstimateMethod::PostCompactCharEstimate);
        assert_eq!(est.tokens, COMPACT_SUMMARY_TOKENS + 10);
        assert_eq!(est.turns, 1);
        assert_eq!(est.boundaries, 1);
        assert_eq!(est.pre_compaction_tokens, 155_000);
    }

    #[test]
    fn snake_case_boundary_metadata_is_read() {
        let records = vec![json!({"type": "system", "subtype": "compact_boundary", "compact_metadata": {"pre_tokens": 42}})];
        let est = estimate_records(&records, 3.5);
        assert_eq!(est.pre_compaction_tokens, 42);
        assert_eq!(est.tokens, COMPACT_SUMMARY_TOKENS);
    }

    #[test]
    fn missing_transcript_is_none() {
        let est = estimate_transcript(Path::new("/nonexistent/t.jsonl"), 3.5).unwrap();
        assert_eq!(est, UsageEstimate::empty());
    }
}
