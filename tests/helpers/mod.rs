#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};

use ctxvault::cli::input::HookInput;
use ctxvault::config::VaultConfig;
use ctxvault::context::EngineContext;
use serde_json::{json, Value};

/// Config rooted in `dir`, hash embeddings only, pinned to `backend`.
pub fn test_config(dir: &Path, backend: &str) -> VaultConfig {
    let mut config = VaultConfig::default();
    config.storage.data_dir = dir.join("data").to_string_lossy().into_owned();
    config.storage.backend = backend.into();
    config.embedding.provider = "hash".into();
    config.embedding.cache_dir = dir.join("models").to_string_lossy().into_owned();
    config
}

/// A fresh per-invocation context, as each hook process would build.
pub async fn context(config: &VaultConfig) -> EngineContext {
    EngineContext::resolve(config.clone()).await
}

/// One user/assistant exchange in the host's envelope format. Odd turns call
/// a tool on a file.
pub fn turn_records(i: usize) -> Vec<Value> {
    let mut blocks = vec![json!({"type": "text", "text": format!("Handled request {i}.\nDetails follow.")})];
    if i % 2 == 1 {
        blocks.push(json!({"type": "tool_use", "name": "Edit", "input": {"file_path": format!("/work/src/mod{i}.rs")}}));
    }
    vec![
        json!({"type": "user", "message": {"role": "user", "content": format!("Please do task {i}")}}),
        json!({"type": "assistant", "message": {"role": "assistant", "content": blocks}}),
    ]
}

pub fn append_records(path: &Path, records: &[Value]) {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    for record in records {
        writeln!(file, "{record}").unwrap();
    }
}

/// Write a transcript of `turns` exchanges (plus some noise lines).
pub fn write_transcript(dir: &Path, turns: usize) -> PathBuf {
    let path = dir.join("transcript.jsonl");
    append_records(&path, &[json!({"type": "progress", "data": {}})]);
    for i in 0..turns {
        append_records(&path, &turn_records(i));
    }
    std::fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .unwrap()
        .write_all(b"{truncated line\n")
        .unwrap();
    path
}

/// An assistant record reporting `tokens` of context usage.
pub fn usage_record(tokens: u64) -> Value {
    json!({"type": "assistant", "message": {"role": "assistant", "content": "ok",
        "usage": {"input_tokens": 100, "cache_read_input_tokens": tokens - 100}}})
}

pub fn hook_input(session: &str, transcript: &Path) -> HookInput {
    HookInput {
        session_id: Some(session.into()),
        transcript_path: Some(transcript.to_string_lossy().into_owned()),
        trigger: None,
        source: None,
    }
}

pub fn session_start(session: &str, source: &str) -> HookInput {
    HookInput {
        session_id: Some(session.into()),
        source: Some(source.into()),
        ..HookInput::default()
    }
}

/// `additionalContext` from a hook's stdout payload.
pub fn additional_context(stdout: &str) -> String {
    let payload: Value = serde_json::from_str(stdout).unwrap();
    payload["hookSpecificOutput"]["additionalContext"]
        .as_str()
        .unwrap()
        .to_string()
}

/// Like [`write_transcript`], but no turn uses tools, so every archived turn
/// carries the same richness.
pub fn write_plain_transcript(dir: &Path, turns: usize) -> PathBuf {
    let path = dir.join("plain.jsonl");
    for i in 0..turns {
        append_records(
            &path,
            &[
                json!({"type": "user", "message": {"role": "user", "content": format!("Question {i}")}}),
                json!({"type": "assistant", "message": {"role": "assistant", "content": format!("Answer {i}")}}),
            ],
        );
    }
    path
}
