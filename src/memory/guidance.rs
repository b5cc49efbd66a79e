//! Compaction guidance: the text `archive-before-compaction` prints so the
//! host's summarizer knows what to keep.

use super::store::ArchiveResult;
use crate::config::ARCHIVE_NAMESPACE;
use crate::transcript::chunk::Turn;
use crate::transcript::extract::{self, first_line, shorten_path, take_chars};

const MAX_FILES: usize = 15;
const MAX_DECISIONS: usize = 5;
const DECISION_CHARS: usize = 120;
const RECENT_TURNS: usize = 5;
const RECENT_LINE_CHARS: usize = 80;

const DECISION_MARKERS: [&str; 5] = ["decided", "choosing", "approach", "instead of", "rather than"];

/// First line of a reply that reads like a decision, if any.
fn decision_line(reply: &str) -> Option<&str> {
    let lower = reply.to_lowercase();
    if !DECISION_MARKERS.iter().any(|m| lower.contains(m)) {
        return None;
    }
    let line = first_line(reply);
    (line.chars().count() > 10).then(|| take_chars(line, DECISION_CHARS))
}

/// Render guidance for `turns`, capped at `budget` bytes (`...` marks a cut).
pub fn compaction_guidance(turns: &[Turn], session_id: &str, archived: ArchiveResult, budget: usize) -> String {
    let mut tools: Vec<String> = Vec::new();
    let mut files: Vec<String> = Vec::new();
    let mut decisions: Vec<String> = Vec::new();

    for turn in turns {
        for name in extract::tool_names(&turn.tool_calls) {
            if !tools.contains(&name) {
                tools.push(name);
            }
        }
        for path in extract::file_paths(&turn.tool_calls) {
            if !files.contains(&path) {
                files.push(path);
            }
        }
        if let Some(line) = decision_line(&turn.assistant_text()) {
            decisions.push(line.to_string());
        }
    }

    let mut out: Vec<String> = vec![
        "COMPACTION GUIDANCE (from ctxvault):".into(),
        String::new(),
        format!(
            "All {} conversation turns have been archived to the {ARCHIVE_NAMESPACE} store.",
            turns.len()
        ),
        format!(
            "Session: {session_id} | Stored: {} new, {} deduped.",
            archived.stored, archived.deduped
        ),
        "After compaction, archived context will be restored automatically at session start.".into(),
        String::new(),
        "PRESERVE in compaction summary:".into(),
    ];

    if !files.is_empty() {
        let short: Vec<String> = files.iter().take(MAX_FILES).map(|f| shorten_path(f, 3)).collect();
        out.push(format!("- Files modified/read: {}", short.join(", ")));
    }
    if !tools.is_empty() {
        out.push(format!("- Tools used: {}", tools.join(", ")));
    }
    if !decisions.is_empty() {
        out.push("- Key decisions:".into());
        out.extend(decisions.iter().take(MAX_DECISIONS).map(|d| format!("  * {d}")));
    }

    let recent = &turns[turns.len().saturating_sub(RECENT_TURNS)..];
    if !recent.is_empty() {
        out.push(String::new());
        out.push("MOST RECENT TURNS (prioritize preserving):".into());
        for turn in recent {
            let user_text = turn.user_text();
            let line = take_chars(first_line(&user_text), RECENT_LINE_CHARS);
            let names = extract::tool_names(&turn.tool_calls);
            if names.is_empty() {
                out.push(format!("- [Turn {}] {line}", turn.index));
            } else {
                out.push(format!("- [Turn {}] {line} ({})", turn.index, names.join(", ")));
            }
        }
    }

    cap(out.join("\n"), budget)
}

fn cap(text: String, budget: usize) -> String {
    if text.len() <= budget {
        return text;
    }
    let mut end = budget.saturating_sub(3);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::chunk::chunk_messages;
    use crate::transcript::messages_from_records;
    use serde_json::json;

    fn turns() -> Vec<Turn> {
        let records = vec![
            json!({"role": "user", "content": "Set up the parser\nwith details"}),
            json!({"role": "assistant", "content": [
                {"type": "text", "text": "I decided to use a recursive descent parser.\nMore text."},
                {"type": "tool_use", "name": "Write", "input": {"file_path": "/home/me/proj/src/parse/mod.rs"}}
            ]}),
            json!({"role": "user", "content": "Now run tests"}),
            json!({"role": "assistant", "content": [
                {"type": "tool_use", "name": "Bash", "input": {"command": "cargo test"}},
                {"type": "text", "text": "All green."}
            ]}),
        ];
        chunk_messages(messages_from_records(&records), 500)
    }

    #[test]
    fn guidance_lists_files_tools_decisions_and_recent_turns() {
        let text = compaction_guidance(&turns(), "sess", ArchiveResult { stored: 2, deduped: 0 }, 2000);
        assert!(text.starts_with("COMPACTION GUIDANCE"));
        assert!(text.contains("Session: sess | Stored: 2 new, 0 deduped."));
        assert!(text.contains("- Files modified/read: .../src/parse/mod.rs"));
        assert!(text.contains("- Tools used: Write, Bash"));
        assert!(text.contains("  * I decided to use a recursive descent parser."));
        assert!(text.contains("- [Turn 0] Set up the parser (Write)"));
        assert!(text.contains("- [Turn 1] Now run tests (Bash)"));
    }

    #[test]
    fn guidance_is_capped_with_ellipsis() {
        let text = compaction_guidance(&turns(), "sess", ArchiveResult::default(), 100);
        assert_eq!(text.len(), 100);
        assert!(text.ends_with("..."));
    }

    #[test]
    fn short_or_unmarked_replies_are_not_decisions() {
        assert_eq!(decision_line("decided."), None);
        assert_eq!(decision_line("Everything compiled fine today."), None);
        assert_eq!(
            decision_line("\nWe use X rather than Y here."),
            Some("We use X rather than Y here.")
        );
    }
}
