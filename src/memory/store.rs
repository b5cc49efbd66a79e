//! Write path: turns to entries, hash dedup, one bulk insert.
//!
//! [`archive_turns`] is the single entry point. Duplicates are filtered twice:
//! a cheap `hash_exists` check here, then the backend's atomic conditional
//! insert, which is what actually holds under concurrent hook invocations.

use std::collections::HashSet;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::scoring::INITIAL_CONFIDENCE;
use super::types::{EntryMetadata, MemoryEntry, Trigger};
use crate::config::ARCHIVE_NAMESPACE;
use crate::storage::StorageBackend;
use crate::transcript::chunk::Turn;
use crate::transcript::extract;

/// Outcome of one archival run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArchiveResult {
    pub stored: usize,
    pub deduped: usize,
}

/// Build the archive entry for one turn.
pub fn build_entry(session_id: &str, turn: &Turn, trigger: Trigger, now: DateTime<Utc>) -> MemoryEntry {
    let content = extract::reconstruct(turn);
    let tool_names = extract::tool_names(&turn.tool_calls);
    let file_paths = extract::file_paths(&turn.tool_calls);
    let content_hash = extract::content_hash(&content);

    let mut tags = vec![
        "transcript".to_string(),
        "compaction".to_string(),
        session_id.to_string(),
    ];
    tags.extend(tool_names.iter().cloned());

    MemoryEntry {
        id: uuid::Uuid::now_v7().to_string(),
        key: format!("transcript:{session_id}:{}:{}", turn.index, now.timestamp_millis()),
        content,
        namespace: ARCHIVE_NAMESPACE.to_string(),
        tags,
        metadata: EntryMetadata {
            session_id: session_id.to_string(),
            chunk_index: turn.index,
            trigger,
            timestamp: now,
            tool_names,
            file_paths,
            summary: extract::summarize(turn),
            content_hash,
            turn_range: (turn.index, turn.index),
        },
        confidence: INITIAL_CONFIDENCE,
        access_count: 0,
        last_accessed_at: now,
        created_at: now,
        updated_at: now,
        embedding: None,
    }
}

/// Archive every turn not already present, in transcript order.
pub async fn archive_turns(
    backend: &dyn StorageBackend,
    session_id: &str,
    turns: &[Turn],
    trigger: Trigger,
) -> Result<ArchiveResult> {
    let now = Utc::now();
    let mut seen: HashSet<String> = HashSet::new();
    let mut fresh: Vec<MemoryEntry> = Vec::new();

    for turn in turns {
        let entry = build_entry(session_id, turn, trigger, now);
        if !seen.insert(entry.content_hash().to_string()) {
            continue;
        }
        let exists = backend
            .hash_exists(ARCHIVE_NAMESPACE, entry.content_hash())
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "hash check failed, relying on conditional insert");
                false
            });
        if !exists {
            fresh.push(entry);
        }
    }

    let stored = if fresh.is_empty() {
        0
    } else {
        backend.bulk_insert(&fresh).await?
    };

    let result = ArchiveResult {
        stored,
        deduped: turns.len() - stored,
    };
    tracing::debug!(
        backend = %backend.kind(),
        session = session_id,
        stored = result.stored,
        deduped = result.deduped,
        "archived turns"
    );
    Ok(result)
}
