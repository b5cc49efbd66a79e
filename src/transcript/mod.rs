//! Transcript reading.
//!
//! The host writes one JSON record per line. Conversation messages either sit
//! at the top level (`{"role": ..., "content": ...}`) or inside an envelope
//! (`{"type": "user", "message": {...}}`); every other record kind (progress,
//! snapshots, queue operations) is ignored, and so is any line that does not
//! parse.

pub mod chunk;
pub mod extract;

use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        #[serde(default = "unknown_tool")]
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult,
    #[serde(other)]
    Other,
}

fn unknown_tool() -> String {
    "unknown".into()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: Option<Content>,
    /// Some producers put plain text here instead of `content`.
    #[serde(default)]
    pub text: Option<String>,
}

impl Message {
    pub fn user(text: &str) -> Self {
        Self {
            role: Role::User,
            content: Some(Content::Text(text.into())),
            text: None,
        }
    }

    pub fn blocks(&self) -> &[ContentBlock] {
        match &self.content {
            Some(Content::Blocks(blocks)) => blocks,
            _ => &[],
        }
    }

    /// The message's text: plain content, or its text blocks joined by newlines.
    pub fn text(&self) -> String {
        match &self.content {
            Some(Content::Text(s)) => s.clone(),
            Some(Content::Blocks(blocks)) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
            None => self.text.clone().unwrap_or_default(),
        }
    }

    /// A user message made only of tool results: plumbing, not a new turn.
    pub fn is_tool_result_echo(&self) -> bool {
        self.role == Role::User
            && matches!(&self.content, Some(Content::Blocks(blocks))
                if blocks.iter().all(|b| matches!(b, ContentBlock::ToolResult)))
    }
}

/// Every line of the transcript that parses as JSON. A missing file reads as empty.
pub fn read_records(path: &Path) -> Result<Vec<Value>> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "transcript not found");
        return Ok(Vec::new());
    }
    let file = std::fs::File::open(path)
        .with_context(|| format!("failed to open transcript {}", path.display()))?;

    Ok(BufReader::new(file)
        .lines()
        .map_while(Result::ok)
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str::<Value>(&line).ok())
        .collect())
}

/// Unwrap a record to the message it carries, if it carries one.
pub fn message_from_record(record: &Value) -> Option<Message> {
    let inner = record.get("message").filter(|m| m.get("role").is_some());
    let candidate = match inner {
        Some(message) => message,
        None if record.get("role").is_some() => record,
        None => return None,
    };
    serde_json::from_value(candidate.clone()).ok()
}

pub fn messages_from_records(records: &[Value]) -> Vec<Message> {
    records.iter().filter_map(message_from_record).collect()
}

/// Read a transcript into role-tagged messages.
pub fn read_transcript(path: &Path) -> Result<Vec<Message>> {
    Ok(messages_from_records(&read_records(path)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_lines(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    #[test]
    fn unwraps_envelopes_and_skips_noise() {
        let file = write_lines(&[
            r#"{"type":"user","message":{"role":"user","content":"hello"}}"#,
            r#"{"type":"progress","data":{}}"#,
            r#"this is not json"#,
            r#"{"role":"assistant","content":[{"type":"text","text":"hi"},{"type":"tool_use","name":"Read","input":{"file_path":"/a/b.rs"}}]}"#,
            r#"{"type":"file-history-snapshot","snapshot":{}}"#,
            "",
        ]);

        let messages = read_transcript(file.path()).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].text(), "hello");
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].text(), "hi");
        assert!(matches!(&messages[1].blocks()[1], ContentBlock::ToolUse { name, .. } if name == "Read"));
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let messages = read_transcript(Path::new("/definitely/not/here.jsonl")).unwrap();
        assert!(messages.is_empty());
    }

    #[test]
    fn unknown_block_types_and_text_fallback() {
        let file = write_lines(&[
            r#"{"role":"assistant","content":[{"type":"thinking","thinking":"..."},{"type":"text","text":"done"}]}"#,
            r#"{"role":"user","text":"legacy"}"#,
            r#"{"role":"system","content":"ignored by the chunker"}"#,
        ]);
        let messages = read_transcript(file.path()).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].text(), "done");
        assert_eq!(messages[1].text(), "legacy");
        assert_eq!(messages[2].role, Role::Other);
    }

    #[test]
    fn detects_tool_result_echo() {
        let record: Value = serde_json::json!({
            "role": "user",
            "content": [{"type": "tool_result", "tool_use_id": "t1", "content": "ok"}]
        });
        let message = message_from_record(&record).unwrap();
        assert!(message.is_tool_result_echo());
        assert!(!Message::user("real question").is_tool_result_echo());
    }
}
