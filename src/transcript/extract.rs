//! Structural metadata for a turn: tools, files, summary and content hash.
//! Nothing here interprets the text beyond picking lines.

use sha2::{Digest, Sha256};

use super::chunk::{ToolCall, Turn};

/// Tool input keys that carry a file path.
const PATH_KEYS: [&str; 3] = ["file_path", "path", "notebook_path"];

const SUMMARY_USER_CHARS: usize = 100;
const SUMMARY_ASSISTANT_CHARS: usize = 120;
const SUMMARY_MAX_CHARS: usize = 300;
const SUMMARY_MAX_FILES: usize = 5;

/// Distinct tool names in first-use order.
pub fn tool_names(calls: &[ToolCall]) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for call in calls {
        if !names.contains(&call.name) {
            names.push(call.name.clone());
        }
    }
    names
}

/// Distinct file paths named by any tool call, in first-seen order.
pub fn file_paths(calls: &[ToolCall]) -> Vec<String> {
    let mut paths: Vec<String> = Vec::new();
    for call in calls {
        for key in PATH_KEYS {
            if let Some(path) = call.input.get(key).and_then(|v| v.as_str()) {
                if !path.is_empty() && !paths.iter().any(|p| p == path) {
                    paths.push(path.to_string());
                }
            }
        }
    }
    paths
}

/// `.../b/c.rs` for paths with more than `keep` segments.
pub fn shorten_path(path: &str, keep: usize) -> String {
    let segments: Vec<&str> = path.split('/').collect();
    if segments.len() > keep {
        format!(".../{}", segments[segments.len() - keep..].join("/"))
    } else {
        path.to_string()
    }
}

pub fn first_line(text: &str) -> &str {
    text.lines().find(|l| !l.trim().is_empty()).unwrap_or("")
}

pub fn take_chars(text: &str, max: usize) -> &str {
    crate::embedding::truncate_chars(text, max)
}

/// `first user line | Tools: .. | Files: .. | first two reply lines`, capped.
pub fn summarize(turn: &Turn) -> String {
    let mut parts: Vec<String> = Vec::new();

    let user_text = turn.user_text();
    let user_line = first_line(&user_text);
    if !user_line.is_empty() {
        parts.push(take_chars(user_line, SUMMARY_USER_CHARS).to_string());
    }

    let tools = tool_names(&turn.tool_calls);
    if !tools.is_empty() {
        parts.push(format!("Tools: {}", tools.join(", ")));
    }

    let files = file_paths(&turn.tool_calls);
    if !files.is_empty() {
        let short: Vec<String> = files
            .iter()
            .take(SUMMARY_MAX_FILES)
            .map(|p| shorten_path(p, 2))
            .collect();
        parts.push(format!("Files: {}", short.join(", ")));
    }

    let reply = turn.assistant_text();
    let reply_lines: Vec<&str> = reply.lines().filter(|l| !l.trim().is_empty()).take(2).collect();
    if !reply_lines.is_empty() {
        parts.push(take_chars(&reply_lines.join(" "), SUMMARY_ASSISTANT_CHARS).to_string());
    }

    take_chars(&parts.join(" | "), SUMMARY_MAX_CHARS).to_string()
}

/// The text that gets archived and hashed.
pub fn reconstruct(turn: &Turn) -> String {
    format!("User: {}\n\nAssistant: {}", turn.user_text(), turn.assistant_text())
}

/// Hex SHA-256 of the reconstructed text.
pub fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}
