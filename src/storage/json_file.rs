//! Tier 4: a single JSON array on disk.
//!
//! Always available. The whole file is rewritten after every mutation, so two
//! processes writing at once lose one of the writes (last writer wins). No
//! confidence decay, importance ranking or vector search.

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{BackendKind, Capabilities, EntryQuery, StorageBackend, StorageError};
use crate::memory::scoring::boosted;
use crate::memory::types::{MemoryEntry, SessionSummary};

pub struct JsonFileBackend {
    path: PathBuf,
    entries: Mutex<Option<Vec<MemoryEntry>>>,
}

impl JsonFileBackend {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            entries: Mutex::new(None),
        }
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut Vec<MemoryEntry>) -> T) -> Result<T> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|e| anyhow::anyhow!("entry lock poisoned: {e}"))?;
        let entries = guard.as_mut().ok_or(StorageError::NotInitialized)?;
        Ok(f(entries))
    }

    /// Apply a mutation and write the file if it reports a change.
    fn mutate<T>(&self, f: impl FnOnce(&mut Vec<MemoryEntry>) -> (T, bool)) -> Result<T> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|e| anyhow::anyhow!("entry lock poisoned: {e}"))?;
        let entries = guard.as_mut().ok_or(StorageError::NotInitialized)?;
        let (out, changed) = f(entries);
        if changed {
            self.persist(entries)?;
        }
        Ok(out)
    }

    fn persist(&self, entries: &[MemoryEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(entries)?;
        std::fs::write(&tmp, body)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }

    fn load(&self) -> Vec<MemoryEntry> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        // Entries are decoded one by one so a single bad record does not cost the rest.
        match serde_json::from_str::<Vec<serde_json::Value>>(&raw) {
            Ok(values) => values
                .into_iter()
                .filter_map(|v| serde_json::from_value(v).ok())
                .collect(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "archive file unreadable, starting fresh");
                Vec::new()
            }
        }
    }
}

fn insert_unique(entries: &mut Vec<MemoryEntry>, entry: &MemoryEntry) -> bool {
    let duplicate = entries
        .iter()
        .any(|e| e.namespace == entry.namespace && e.content_hash() == entry.content_hash());
    if !duplicate {
        entries.push(entry.clone());
    }
    !duplicate
}

#[async_trait]
impl StorageBackend for JsonFileBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Json
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            mark_accessed: true,
            prune_stale: true,
            ..Capabilities::default()
        }
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }

    async fn initialize(&self) -> Result<()> {
        let loaded = self.load();
        let mut guard = self
            .entries
            .lock()
            .map_err(|e| anyhow::anyhow!("entry lock poisoned: {e}"))?;
        *guard = Some(loaded);
        Ok(())
    }

    async fn store(&self, entry: &MemoryEntry) -> Result<bool> {
        self.mutate(|entries| {
            let inserted = insert_unique(entries, entry);
            (inserted, inserted)
        })
    }

    async fn bulk_insert(&self, batch: &[MemoryEntry]) -> Result<usize> {
        self.mutate(|entries| {
            let inserted = batch.iter().filter(|e| insert_unique(entries, e)).count();
            (inserted, inserted > 0)
        })
    }

    async fn query(&self, query: &EntryQuery) -> Result<Vec<MemoryEntry>> {
        self.with_entries(|entries| {
            let mut found: Vec<MemoryEntry> = entries
                .iter()
                .filter(|e| query.namespace.as_ref().is_none_or(|ns| &e.namespace == ns))
                .filter(|e| query.session_id.as_ref().is_none_or(|s| e.session_id() == s))
                .cloned()
                .collect();
            found.sort_by(|a, b| {
                b.created_at
                    .cmp(&a.created_at)
                    .then(b.chunk_index().cmp(&a.chunk_index()))
            });
            if let Some(limit) = query.limit {
                found.truncate(limit);
            }
            found
        })
    }

    async fn query_by_session(&self, namespace: &str, session_id: &str) -> Result<Vec<MemoryEntry>> {
        self.with_entries(|entries| {
            let mut found: Vec<MemoryEntry> = entries
                .iter()
                .filter(|e| e.namespace == namespace && e.session_id() == session_id)
                .cloned()
                .collect();
            found.sort_by(|a, b| b.chunk_index().cmp(&a.chunk_index()));
            found
        })
    }

    async fn count(&self, namespace: Option<&str>) -> Result<u64> {
        self.with_entries(|entries| {
            entries
                .iter()
                .filter(|e| namespace.is_none_or(|ns| e.namespace == ns))
                .count() as u64
        })
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        self.with_entries(|entries| {
            let mut names: Vec<String> = entries.iter().map(|e| e.namespace.clone()).collect();
            names.sort();
            names.dedup();
            names
        })
    }

    async fn list_sessions(&self, namespace: &str) -> Result<Vec<SessionSummary>> {
        self.with_entries(|entries| sessions_by_recency(entries.iter().filter(|e| e.namespace == namespace)))
    }

    async fn hash_exists(&self, namespace: &str, content_hash: &str) -> Result<bool> {
        self.with_entries(|entries| {
            entries
                .iter()
                .any(|e| e.namespace == namespace && e.content_hash() == content_hash)
        })
    }

    async fn clear_namespace(&self, namespace: &str) -> Result<usize> {
        self.mutate(|entries| {
            let before = entries.len();
            entries.retain(|e| e.namespace != namespace);
            let removed = before - entries.len();
            (removed, removed > 0)
        })
    }

    async fn shutdown(&self) -> Result<()> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|e| anyhow::anyhow!("entry lock poisoned: {e}"))?;
        guard.take();
        Ok(())
    }

    async fn mark_accessed(&self, ids: &[String]) -> Result<usize> {
        let now = Utc::now();
        self.mutate(|entries| {
            let mut updated = 0;
            for entry in entries.iter_mut().filter(|e| ids.contains(&e.id)) {
                entry.access_count += 1;
                entry.confidence = boosted(entry.confidence);
                entry.last_accessed_at = now;
                updated += 1;
            }
            (updated, updated > 0)
        })
    }

    async fn prune_stale(&self, namespace: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        self.mutate(|entries| {
            let before = entries.len();
            entries.retain(|e| !(e.namespace == namespace && e.access_count == 0 && e.created_at < cutoff));
            let removed = before - entries.len();
            (removed, removed > 0)
        })
    }
}

/// Group entries by session, most recently written session first.
pub(crate) fn sessions_by_recency<'a>(entries: impl Iterator<Item = &'a MemoryEntry>) -> Vec<SessionSummary> {
    let mut sessions: Vec<(String, u64, DateTime<Utc>)> = Vec::new();
    for entry in entries {
        match sessions.iter_mut().find(|(id, _, _)| id == entry.session_id()) {
            Some((_, count, latest)) => {
                *count += 1;
                *latest = (*latest).max(entry.created_at);
            }
            None => sessions.push((entry.session_id().to_string(), 1, entry.created_at)),
        }
    }
    sessions.sort_by(|a, b| b.2.cmp(&a.2));
    sessions
        .into_iter()
        .map(|(session_id, entries, _)| SessionSummary { session_id, entries })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::{EntryMetadata, Trigger};
    use chrono::Duration;

    const NS: &str = "transcript-archive";

    fn entry(session: &str, chunk: u32, created: DateTime<Utc>) -> MemoryEntry {
        MemoryEntry {
            id: format!("{session}-{chunk}"),
            key: format!("transcript:{session}:{chunk}:0"),
            content: format!("User: {session} {chunk}\n\nAssistant: ok"),
            namespace: NS.into(),
            tags: vec![],
            metadata: EntryMetadata {
                session_id: session.into(),
                chunk_index: chunk,
                trigger: Trigger::Manual,
                timestamp: created,
                tool_names: vec![],
                file_paths: vec![],
                summary: String::new(),
                content_hash: format!("hash-{session}-{chunk}"),
                turn_range: (chunk, chunk),
            },
            confidence: 0.8,
            access_count: 0,
            last_accessed_at: created,
            created_at: created,
            updated_at: created,
            embedding: None,
        }
    }

    #[tokio::test]
    async fn persists_across_instances() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("archive.json");
        let now = Utc::now();

        let first = JsonFileBackend::new(path.clone());
        first.initialize().await.unwrap();
        assert_eq!(first.bulk_insert(&[entry("s1", 0, now), entry("s1", 1, now)]).await.unwrap(), 2);
        assert_eq!(first.bulk_insert(&[entry("s1", 1, now)]).await.unwrap(), 0);

        let second = JsonFileBackend::new(path);
        second.initialize().await.unwrap();
        assert_eq!(second.count(Some(NS)).await.unwrap(), 2);
        let chunks: Vec<u32> = second
            .query_by_session(NS, "s1")
            .await
            .unwrap()
            .iter()
            .map(|e| e.chunk_index())
            .collect();
        assert_eq!(chunks, vec![1, 0]);
    }

    #[tokio::test]
    async fn corrupt_file_starts_fresh() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("archive.json");
        std::fs::write(&path, "{not json").unwrap();

        let backend = JsonFileBackend::new(path);
        backend.initialize().await.unwrap();
        assert_eq!(backend.count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn access_and_age_pruning() {
        let dir = tempfile::TempDir::new().unwrap();
        let backend = JsonFileBackend::new(dir.path().join("archive.json"));
        backend.initialize().await.unwrap();
        let now = Utc::now();
        let old = entry("s1", 0, now - Duration::days(60));
        let old_read = entry("s1", 1, now - Duration::days(60));
        backend.bulk_insert(&[old, old_read.clone(), entry("s2", 0, now)]).await.unwrap();

        assert_eq!(backend.mark_accessed(&[old_read.id.clone()]).await.unwrap(), 1);
        assert_eq!(backend.prune_stale(NS, now - Duration::days(30)).await.unwrap(), 1);

        let sessions = backend.list_sessions(NS).await.unwrap();
        assert_eq!(sessions[0].session_id, "s2");
        assert_eq!(sessions[1].entries, 1);

        let kept = backend.query_by_session(NS, "s1").await.unwrap();
        assert!((kept[0].confidence - 0.83).abs() < 1e-9);
    }
}
