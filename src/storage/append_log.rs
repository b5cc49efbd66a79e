//! Tier 3: an append-only operation journal replayed into memory.
//!
//! Every mutation is one JSON line (`insert`, `access`, `embed`, `delete`),
//! so writers only ever append. On load the journal is replayed into a
//! vector of entries plus an in-memory vector index used for semantic
//! search. Lines that fail to decode are skipped, and a trailing record cut
//! off mid-write is truncated away before anything new is appended.
//!
//! Once the journal holds more superseded lines than live entries it is
//! rewritten as one `insert` per live entry (vector inline) through a tmp
//! file and a rename. A process appending during that rewrite loses its
//! line, the same last-writer-wins trade the flat-file tier makes.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::json_file::sessions_by_recency;
use super::{from_millis, BackendKind, Capabilities, EntryQuery, StorageBackend, StorageError};
use crate::embedding::cosine_similarity;
use crate::memory::scoring::boosted;
use crate::memory::types::{MemoryEntry, SemanticHit, SessionSummary};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogOp {
    Insert { entry: MemoryEntry },
    Access { ids: Vec<String>, at: i64 },
    Embed { id: String, vector: Vec<f32> },
    Delete { ids: Vec<String> },
}

struct Journal {
    path: PathBuf,
    entries: Vec<MemoryEntry>,
    vectors: HashMap<String, Vec<f32>>,
    file: File,
    /// Lines currently in the file.
    lines: usize,
}

impl Journal {
    fn apply(&mut self, op: LogOp) {
        match op {
            LogOp::Insert { mut entry } => {
                if self.has_hash(&entry.namespace, entry.content_hash()) {
                    return;
                }
                if let Some(vector) = entry.embedding.take() {
                    self.vectors.insert(entry.id.clone(), vector);
                }
                self.entries.push(entry);
            }
            LogOp::Access { ids, at } => {
                for entry in self.entries.iter_mut().filter(|e| ids.contains(&e.id)) {
                    entry.access_count += 1;
                    entry.confidence = boosted(entry.confidence);
                    entry.last_accessed_at = from_millis(at);
                }
            }
            LogOp::Embed { id, vector } => {
                if self.entries.iter().any(|e| e.id == id) {
                    self.vectors.insert(id, vector);
                }
            }
            LogOp::Delete { ids } => {
                self.entries.retain(|e| !ids.contains(&e.id));
                for id in &ids {
                    self.vectors.remove(id);
                }
            }
        }
    }

    fn has_hash(&self, namespace: &str, hash: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.namespace == namespace && e.content_hash() == hash)
    }

    fn append(&mut self, op: &LogOp) -> Result<()> {
        let mut line = serde_json::to_vec(op)?;
        line.push(b'\n');
        self.file.write_all(&line).context("failed to append to journal")?;
        self.lines += 1;
        Ok(())
    }

    /// Append then apply, so the file never lags memory.
    fn record(&mut self, op: LogOp) -> Result<()> {
        let supersedes = !matches!(op, LogOp::Insert { .. });
        self.append(&op)?;
        self.apply(op);
        if supersedes && self.is_bloated() {
            if let Err(e) = self.compact() {
                tracing::warn!(path = %self.path.display(), error = %e, "journal compaction failed");
            }
        }
        Ok(())
    }

    /// More superseded lines than live entries.
    fn is_bloated(&self) -> bool {
        self.lines.saturating_sub(self.entries.len()) > self.entries.len()
    }

    /// Rewrite the journal as one `insert` per live entry.
    fn compact(&mut self) -> Result<()> {
        let tmp = self.path.with_extension("log.tmp");
        {
            let file = File::create(&tmp).with_context(|| format!("failed to create {}", tmp.display()))?;
            let mut out = BufWriter::new(file);
            for entry in &self.entries {
                serde_json::to_writer(&mut out, &LogOp::Insert { entry: self.with_vector(entry) })?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        self.file = open_for_append(&self.path)?;
        tracing::debug!(before = self.lines, after = self.entries.len(), "journal compacted");
        self.lines = self.entries.len();
        Ok(())
    }

    fn with_vector(&self, entry: &MemoryEntry) -> MemoryEntry {
        let mut out = entry.clone();
        out.embedding = self.vectors.get(&entry.id).cloned();
        out
    }
}

fn open_for_append(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open journal {}", path.display()))
}

/// Read the journal, cutting off a final line that never got its newline.
fn read_repaired(path: &Path) -> Result<Vec<u8>> {
    let mut bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("failed to read journal {}", path.display())),
    };
    if bytes.last().is_some_and(|b| *b != b'\n') {
        let keep = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
        OpenOptions::new()
            .write(true)
            .open(path)
            .and_then(|f| f.set_len(keep as u64))
            .with_context(|| format!("failed to truncate torn journal tail in {}", path.display()))?;
        tracing::warn!(dropped = bytes.len() - keep, path = %path.display(), "truncated torn journal tail");
        bytes.truncate(keep);
    }
    Ok(bytes)
}

pub struct AppendLogBackend {
    path: PathBuf,
    journal: Mutex<Option<Journal>>,
}

impl AppendLogBackend {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            journal: Mutex::new(None),
        }
    }

    fn with_journal<T>(&self, f: impl FnOnce(&mut Journal) -> Result<T>) -> Result<T> {
        let mut guard = self
            .journal
            .lock()
            .map_err(|e| anyhow::anyhow!("journal lock poisoned: {e}"))?;
        let journal = guard.as_mut().ok_or(StorageError::NotInitialized)?;
        f(journal)
    }
}

#[async_trait]
impl StorageBackend for AppendLogBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::AppendLog
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            mark_accessed: true,
            prune_stale: true,
            store_embedding: true,
            semantic_search: true,
            all_for_sync: true,
            ..Capabilities::default()
        }
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }

    async fn initialize(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let bytes = read_repaired(&self.path)?;
        let file = open_for_append(&self.path)?;

        let mut journal = Journal {
            path: self.path.clone(),
            entries: Vec::new(),
            vectors: HashMap::new(),
            file,
            lines: 0,
        };
        let mut skipped = 0usize;
        for line in bytes.split(|b| *b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            journal.lines += 1;
            match serde_json::from_slice::<LogOp>(line) {
                Ok(op) => journal.apply(op),
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            tracing::warn!(skipped, path = %self.path.display(), "skipped undecodable journal lines");
        }

        let mut guard = self
            .journal
            .lock()
            .map_err(|e| anyhow::anyhow!("journal lock poisoned: {e}"))?;
        *guard = Some(journal);
        Ok(())
    }

    async fn store(&self, entry: &MemoryEntry) -> Result<bool> {
        self.with_journal(|j| {
            if j.has_hash(&entry.namespace, entry.content_hash()) {
                return Ok(false);
            }
            j.record(LogOp::Insert { entry: entry.clone() })?;
            Ok(true)
        })
    }

    async fn bulk_insert(&self, entries: &[MemoryEntry]) -> Result<usize> {
        self.with_journal(|j| {
            let mut inserted = 0;
            for entry in entries {
                if !j.has_hash(&entry.namespace, entry.content_hash()) {
                    j.record(LogOp::Insert { entry: entry.clone() })?;
                    inserted += 1;
                }
            }
            j.file.flush()?;
            Ok(inserted)
        })
    }

    async fn query(&self, query: &EntryQuery) -> Result<Vec<MemoryEntry>> {
        self.with_journal(|j| {
            let mut found: Vec<MemoryEntry> = j
                .entries
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
            Ok(found)
        })
    }

    async fn query_by_session(&self, namespace: &str, session_id: &str) -> Result<Vec<MemoryEntry>> {
        self.with_journal(|j| {
            let mut found: Vec<MemoryEntry> = j
                .entries
                .iter()
                .filter(|e| e.namespace == namespace && e.session_id() == session_id)
                .cloned()
                .collect();
            found.sort_by(|a, b| b.chunk_index().cmp(&a.chunk_index()));
            Ok(found)
        })
    }

    async fn count(&self, namespace: Option<&str>) -> Result<u64> {
        self.with_journal(|j| {
            Ok(j.entries
                .iter()
                .filter(|e| namespace.is_none_or(|ns| e.namespace == ns))
                .count() as u64)
        })
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        self.with_journal(|j| {
            let mut names: Vec<String> = j.entries.iter().map(|e| e.namespace.clone()).collect();
            names.sort();
            names.dedup();
            Ok(names)
        })
    }

    async fn list_sessions(&self, namespace: &str) -> Result<Vec<SessionSummary>> {
        self.with_journal(|j| Ok(sessions_by_recency(j.entries.iter().filter(|e| e.namespace == namespace))))
    }

    async fn hash_exists(&self, namespace: &str, content_hash: &str) -> Result<bool> {
        self.with_journal(|j| Ok(j.has_hash(namespace, content_hash)))
    }

    async fn clear_namespace(&self, namespace: &str) -> Result<usize> {
        self.with_journal(|j| {
            let ids: Vec<String> = j
                .entries
                .iter()
                .filter(|e| e.namespace == namespace)
                .map(|e| e.id.clone())
                .collect();
            let removed = ids.len();
            if removed > 0 {
                j.record(LogOp::Delete { ids })?;
            }
            Ok(removed)
        })
    }

    async fn shutdown(&self) -> Result<()> {
        let mut guard = self
            .journal
            .lock()
            .map_err(|e| anyhow::anyhow!("journal lock poisoned: {e}"))?;
        if let Some(mut journal) = guard.take() {
            journal.file.flush()?;
        }
        Ok(())
    }

    async fn mark_accessed(&self, ids: &[String]) -> Result<usize> {
        let at = Utc::now().timestamp_millis();
        self.with_journal(|j| {
            let known: Vec<String> = ids
                .iter()
                .filter(|id| j.entries.iter().any(|e| &e.id == *id))
                .cloned()
                .collect();
            let updated = known.len();
            if updated > 0 {
                j.record(LogOp::Access { ids: known, at })?;
            }
            Ok(updated)
        })
    }

    async fn prune_stale(&self, namespace: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        self.with_journal(|j| {
            let ids: Vec<String> = j
                .entries
                .iter()
                .filter(|e| e.namespace == namespace && e.access_count == 0 && e.created_at < cutoff)
                .map(|e| e.id.clone())
                .collect();
            let removed = ids.len();
            if removed > 0 {
                j.record(LogOp::Delete { ids })?;
            }
            Ok(removed)
        })
    }

    async fn store_embedding(&self, id: &str, embedding: &[f32]) -> Result<()> {
        self.with_journal(|j| {
            j.record(LogOp::Embed {
                id: id.to_string(),
                vector: embedding.to_vec(),
            })
        })
    }

    async fn missing_embeddings(&self, namespace: &str, limit: usize) -> Result<Vec<(String, String)>> {
        self.with_journal(|j| {
            Ok(j.entries
                .iter()
                .rev()
                .filter(|e| e.namespace == namespace && !j.vectors.contains_key(&e.id))
                .take(limit)
                .map(|e| (e.id.clone(), e.content.clone()))
                .collect())
        })
    }

    async fn semantic_search(&self, query: &[f32], k: usize, namespace: &str) -> Result<Vec<SemanticHit>> {
        self.with_journal(|j| {
            let mut hits: Vec<SemanticHit> = j
                .entries
                .iter()
                .filter(|e| e.namespace == namespace)
                .filter_map(|e| {
                    let similarity = cosine_similarity(query, j.vectors.get(&e.id)?)?;
                    Some(SemanticHit {
                        id: e.id.clone(),
                        session_id: e.session_id().to_string(),
                        chunk_index: e.chunk_index(),
                        summary: e.summary().to_string(),
                        confidence: e.confidence,
                        similarity,
                        score: f64::from(similarity) * e.confidence,
                    })
                })
                .collect();
            hits.sort_by(|a, b| b.score.total_cmp(&a.score));
            hits.truncate(k);
            Ok(hits)
        })
    }

    async fn all_for_sync(&self, namespace: &str) -> Result<Vec<MemoryEntry>> {
        self.with_journal(|j| {
            let mut all: Vec<MemoryEntry> = j
                .entries
                .iter()
                .filter(|e| e.namespace == namespace)
                .map(|e| j.with_vector(e))
                .collect();
            all.sort_by_key(|e| (e.created_at, e.chunk_index()));
            Ok(all)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::hash::HashEmbeddingProvider;
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
                trigger: Trigger::Proactive,
                timestamp: created,
                tool_names: vec![],
                file_paths: vec![],
                summary: format!("{session} turn {chunk}"),
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
    async fn replay_restores_state() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("archive.log");
        let now = Utc::now();
        let hasher = HashEmbeddingProvider::default();

        {
            let log = AppendLogBackend::new(path.clone());
            log.initialize().await.unwrap();
            log.bulk_insert(&[entry("s1", 0, now - Duration::days(90)), entry("s1", 1, now)])
                .await
                .unwrap();
            log.mark_accessed(&["s1-1".to_string()]).await.unwrap();
            log.store_embedding("s1-1", &hasher.vector("s1 turn 1")).await.unwrap();
            assert_eq!(log.prune_stale(NS, now - Duration::days(30)).await.unwrap(), 1);
            log.shutdown().await.unwrap();
        }

        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"garbage line\n")
            .unwrap();

        let log = AppendLogBackend::new(path);
        log.initialize().await.unwrap();
        let entries = log.query_by_session(NS, "s1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].access_count, 1);
        assert!(log.missing_embeddings(NS, 10).await.unwrap().is_empty());
        assert!(log.all_for_sync(NS).await.unwrap()[0].embedding.is_some());
    }

    #[tokio::test]
    async fn dedups_and_searches_by_vector() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = AppendLogBackend::new(dir.path().join("archive.log"));
        log.initialize().await.unwrap();
        let now = Utc::now();
        let hasher = HashEmbeddingProvider::default();

        assert_eq!(log.bulk_insert(&[entry("s1", 0, now), entry("s2", 0, now)]).await.unwrap(), 2);
        assert!(!log.store(&entry("s1", 0, now)).await.unwrap());

        log.store_embedding("s1-0", &hasher.vector("migrate the schema")).await.unwrap();
        log.store_embedding("s2-0", &[1.0, 0.0]).await.unwrap();

        let hits = log.semantic_search(&hasher.vector("migrate the schema"), 5, NS).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].session_id, "s1");

        assert_eq!(log.clear_namespace(NS).await.unwrap(), 2);
        assert_eq!(log.count(None).await.unwrap(), 0);
    }

    fn line_count(path: &Path) -> usize {
        std::fs::read_to_string(path).unwrap().lines().count()
    }

    #[tokio::test]
    async fn torn_tail_is_cut_before_new_appends() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("archive.log");
        let now = Utc::now();

        let log = AppendLogBackend::new(path.clone());
        log.initialize().await.unwrap();
        assert!(log.store(&entry("s1", 0, now)).await.unwrap());
        log.shutdown().await.unwrap();

        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(br#"{"op":"insert","entry":{"id":"x"#)
            .unwrap();

        let log = AppendLogBackend::new(path.clone());
        log.initialize().await.unwrap();
        assert!(log.store(&entry("s1", 1, now)).await.unwrap());
        assert_eq!(log.count(None).await.unwrap(), 2);
        log.shutdown().await.unwrap();
        assert!(std::fs::read(&path).unwrap().ends_with(b"\n"));

        let log = AppendLogBackend::new(path);
        log.initialize().await.unwrap();
        assert_eq!(log.count(None).await.unwrap(), 2);
        assert_eq!(log.query_by_session(NS, "s1").await.unwrap()[0].chunk_index(), 1);
    }

    #[tokio::test]
    async fn pruning_shrinks_the_journal() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("archive.log");
        let now = Utc::now();
        let hasher = HashEmbeddingProvider::default();

        let log = AppendLogBackend::new(path.clone());
        log.initialize().await.unwrap();
        let old = now - Duration::days(60);
        log.bulk_insert(&[entry("s1", 0, old), entry("s1", 1, old), entry("s1", 2, old), entry("s1", 3, now)])
            .await
            .unwrap();
        log.store_embedding("s1-3", &hasher.vector("keep me")).await.unwrap();
        log.mark_accessed(&["s1-3".to_string()]).await.unwrap();
        let before = line_count(&path);
        assert_eq!(before, 6);

        assert_eq!(log.prune_stale(NS, now - Duration::days(30)).await.unwrap(), 3);
        log.shutdown().await.unwrap();
        assert_eq!(line_count(&path), 1);
        assert!(!path.with_extension("log.tmp").exists());

        let log = AppendLogBackend::new(path);
        log.initialize().await.unwrap();
        let kept = log.all_for_sync(NS).await.unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].access_count, 1);
        assert!(kept[0].embedding.is_some());
    }

    #[tokio::test]
    async fn repeated_access_marks_stay_bounded() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("archive.log");
        let now = Utc::now();

        let log = AppendLogBackend::new(path.clone());
        log.initialize().await.unwrap();
        log.bulk_insert(&[entry("s1", 0, now), entry("s1", 1, now)]).await.unwrap();
        for _ in 0..25 {
            log.mark_accessed(&["s1-1".to_string()]).await.unwrap();
        }
        log.shutdown().await.unwrap();
        assert!(line_count(&path) <= 4, "{} lines", line_count(&path));

        let log = AppendLogBackend::new(path);
        log.initialize().await.unwrap();
        let entries = log.query_by_session(NS, "s1").await.unwrap();
        assert_eq!(entries[0].access_count, 25);
        assert_eq!(entries[1].access_count, 0);
    }
}
