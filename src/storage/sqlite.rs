//! Tier 1: embedded SQLite with sqlite-vec.
//!
//! One connection per process behind a mutex. Dedup rides on the unique
//! `(namespace, content_hash)` index via `INSERT OR IGNORE`, so concurrent
//! hook processes cannot both insert the same turn. Importance ranking runs
//! in SQL through the `importance()` function registered on open.

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::functions::FunctionFlags;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{from_millis, BackendKind, Capabilities, EntryQuery, StorageBackend, StorageError};
use crate::db::{bytes_to_embedding, embedding_to_bytes};
use crate::memory::scoring::{self, ACCESS_BOOST, CONFIDENCE_CEILING, CONFIDENCE_FLOOR};
use crate::memory::types::{EntryMetadata, MemoryEntry, SemanticHit, SessionSummary};

const ENTRY_COLUMNS: &str = "id, key, content, namespace, tags, metadata, confidence, \
    access_count, last_accessed_at, created_at, updated_at, embedding";

pub struct SqliteBackend {
    /// `None` keeps the database in memory.
    path: Option<PathBuf>,
    conn: Mutex<Option<Connection>>,
}

impl SqliteBackend {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path: Some(path),
            conn: Mutex::new(None),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            conn: Mutex::new(None),
        }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("connection lock poisoned: {e}"))?;
        let conn = guard.as_mut().ok_or(StorageError::NotInitialized)?;
        f(conn)
    }
}

/// `importance(created_at, access_count, tool_count, file_count, now)`.
fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "importance",
        5,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let created_at: i64 = ctx.get(0)?;
            let access_count: i64 = ctx.get(1)?;
            let tools: i64 = ctx.get(2)?;
            let files: i64 = ctx.get(3)?;
            let now: i64 = ctx.get(4)?;
            Ok(scoring::importance(
                created_at,
                access_count.clamp(0, u32::MAX as i64) as u32,
                tools.max(0) as usize,
                files.max(0) as usize,
                now,
            ))
        },
    )
}

struct EntryRow {
    id: String,
    key: String,
    content: String,
    namespace: String,
    tags: String,
    metadata: String,
    confidence: f64,
    access_count: i64,
    last_accessed_at: i64,
    created_at: i64,
    updated_at: i64,
    embedding: Option<Vec<u8>>,
}

fn read_row(row: &Row) -> rusqlite::Result<EntryRow> {
    Ok(EntryRow {
        id: row.get(0)?,
        key: row.get(1)?,
        content: row.get(2)?,
        namespace: row.get(3)?,
        tags: row.get(4)?,
        metadata: row.get(5)?,
        confidence: row.get(6)?,
        access_count: row.get(7)?,
        last_accessed_at: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
        embedding: row.get(11)?,
    })
}

impl EntryRow {
    /// `None` (with a warning) when the stored JSON no longer parses.
    fn into_entry(self) -> Option<MemoryEntry> {
        let metadata: EntryMetadata = match serde_json::from_str(&self.metadata) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(id = %self.id, error = %e, "skipping entry with malformed metadata");
                return None;
            }
        };
        Some(MemoryEntry {
            tags: serde_json::from_str(&self.tags).unwrap_or_default(),
            metadata,
            id: self.id,
            key: self.key,
            content: self.content,
            namespace: self.namespace,
            confidence: self.confidence,
            access_count: self.access_count.clamp(0, u32::MAX as i64) as u32,
            last_accessed_at: from_millis(self.last_accessed_at),
            created_at: from_millis(self.created_at),
            updated_at: from_millis(self.updated_at),
            embedding: self.embedding.as_deref().map(bytes_to_embedding),
        })
    }
}

fn collect_entries(rows: Vec<EntryRow>) -> Vec<MemoryEntry> {
    rows.into_iter().filter_map(EntryRow::into_entry).collect()
}

fn insert_entry(conn: &Connection, entry: &MemoryEntry) -> Result<bool> {
    let changed = conn.execute(
        "INSERT OR IGNORE INTO transcript_entries
            (id, key, content, namespace, tags, metadata, session_id, chunk_index, summary,
             content_hash, confidence, access_count, last_accessed_at, created_at, updated_at,
             embedding)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        params![
            entry.id,
            entry.key,
            entry.content,
            entry.namespace,
            serde_json::to_string(&entry.tags)?,
            serde_json::to_string(&entry.metadata)?,
            entry.metadata.session_id,
            entry.metadata.chunk_index,
            entry.metadata.summary,
            entry.metadata.content_hash,
            entry.confidence,
            entry.access_count,
            entry.last_accessed_at.timestamp_millis(),
            entry.created_at.timestamp_millis(),
            entry.updated_at.timestamp_millis(),
            entry.embedding.as_deref().map(embedding_to_bytes),
        ],
    )?;
    Ok(changed > 0)
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::ALL
    }

    fn location(&self) -> String {
        self.path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| ":memory:".into())
    }

    async fn initialize(&self) -> Result<()> {
        let conn = match &self.path {
            Some(path) => crate::db::open_database(path)?,
            None => crate::db::open_memory_database()?,
        };
        register_functions(&conn).context("failed to register importance()")?;
        let mut guard = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("connection lock poisoned: {e}"))?;
        *guard = Some(conn);
        Ok(())
    }

    async fn store(&self, entry: &MemoryEntry) -> Result<bool> {
        self.with_conn(|conn| insert_entry(conn, entry))
    }

    async fn bulk_insert(&self, entries: &[MemoryEntry]) -> Result<usize> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut inserted = 0;
            for entry in entries {
                if insert_entry(&tx, entry)? {
                    inserted += 1;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })
    }

    async fn query(&self, query: &EntryQuery) -> Result<Vec<MemoryEntry>> {
        self.with_conn(|conn| {
            let mut clauses = Vec::new();
            let mut values: Vec<&dyn rusqlite::types::ToSql> = Vec::new();
            if let Some(ns) = &query.namespace {
                values.push(ns);
                clauses.push(format!("namespace = ?{}", values.len()));
            }
            if let Some(session) = &query.session_id {
                values.push(session);
                clauses.push(format!("session_id = ?{}", values.len()));
            }
            let mut sql = format!("SELECT {ENTRY_COLUMNS} FROM transcript_entries");
            if !clauses.is_empty() {
                sql.push_str(&format!(" WHERE {}", clauses.join(" AND ")));
            }
            sql.push_str(" ORDER BY created_at DESC, chunk_index DESC");
            if let Some(limit) = query.limit {
                sql.push_str(&format!(" LIMIT {limit}"));
            }

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(values.as_slice(), read_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(collect_entries(rows))
        })
    }

    async fn query_by_session(&self, namespace: &str, session_id: &str) -> Result<Vec<MemoryEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM transcript_entries
                 WHERE namespace = ?1 AND session_id = ?2
                 ORDER BY chunk_index DESC, created_at DESC"
            ))?;
            let rows = stmt
                .query_map(params![namespace, session_id], read_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(collect_entries(rows))
        })
    }

    async fn count(&self, namespace: Option<&str>) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = match namespace {
                Some(ns) => conn.query_row(
                    "SELECT COUNT(*) FROM transcript_entries WHERE namespace = ?1",
                    [ns],
                    |r| r.get(0),
                )?,
                None => conn.query_row("SELECT COUNT(*) FROM transcript_entries", [], |r| r.get(0))?,
            };
            Ok(count as u64)
        })
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT DISTINCT namespace FROM transcript_entries ORDER BY namespace")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(names)
        })
    }

    async fn list_sessions(&self, namespace: &str) -> Result<Vec<SessionSummary>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT session_id, COUNT(*) FROM transcript_entries
                 WHERE namespace = ?1
                 GROUP BY session_id
                 ORDER BY MAX(created_at) DESC",
            )?;
            let sessions = stmt
                .query_map([namespace], |row| {
                    Ok(SessionSummary {
                        session_id: row.get(0)?,
                        entries: row.get::<_, i64>(1)? as u64,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(sessions)
        })
    }

    async fn hash_exists(&self, namespace: &str, content_hash: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM transcript_entries WHERE namespace = ?1 AND content_hash = ?2 LIMIT 1",
                    params![namespace, content_hash],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }

    async fn clear_namespace(&self, namespace: &str) -> Result<usize> {
        self.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM transcript_entries WHERE namespace = ?1", [namespace])?)
        })
    }

    async fn shutdown(&self) -> Result<()> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("connection lock poisoned: {e}"))?;
        if let Some(conn) = guard.take() {
            conn.execute_batch("PRAGMA optimize;")?;
            conn.close().map_err(|(_, e)| e)?;
        }
        Ok(())
    }

    async fn mark_accessed(&self, ids: &[String]) -> Result<usize> {
        let now = Utc::now().timestamp_millis();
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut updated = 0;
            {
                let mut stmt = tx.prepare(
                    "UPDATE transcript_entries
                     SET access_count = access_count + 1,
                         last_accessed_at = ?1,
                         confidence = MIN(?2, confidence + ?3)
                     WHERE id = ?4",
                )?;
                for id in ids {
                    updated += stmt.execute(params![now, CONFIDENCE_CEILING, ACCESS_BOOST, id])?;
                }
            }
            tx.commit()?;
            Ok(updated)
        })
    }

    async fn decay_confidence(&self, namespace: &str, rate: f64, hours: f64) -> Result<usize> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE transcript_entries SET confidence = MAX(?1, confidence - ?2)
                 WHERE namespace = ?3 AND confidence > ?1",
                params![CONFIDENCE_FLOOR, rate * hours.max(0.0), namespace],
            )?)
        })
    }

    async fn prune_by_confidence(&self, namespace: &str, threshold: f64) -> Result<usize> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM transcript_entries
                 WHERE namespace = ?1 AND confidence <= ?2 AND access_count = 0",
                params![namespace, threshold],
            )?)
        })
    }

    async fn prune_stale(&self, namespace: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM transcript_entries
                 WHERE namespace = ?1 AND access_count = 0 AND created_at < ?2",
                params![namespace, cutoff.timestamp_millis()],
            )?)
        })
    }

    async fn query_by_importance(
        &self,
        namespace: &str,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<(MemoryEntry, f64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS},
                        importance(created_at, access_count,
                                   COALESCE(json_array_length(metadata, '$.toolNames'), 0),
                                   COALESCE(json_array_length(metadata, '$.filePaths'), 0),
                                   ?3) AS score
                 FROM transcript_entries
                 WHERE namespace = ?1 AND session_id = ?2
                 ORDER BY score DESC, chunk_index DESC"
            ))?;
            let rows = stmt
                .query_map(params![namespace, session_id, now.timestamp_millis()], |row| {
                    Ok((read_row(row)?, row.get::<_, f64>(12)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows
                .into_iter()
                .filter_map(|(row, score)| row.into_entry().map(|e| (e, score)))
                .collect())
        })
    }

    async fn store_embedding(&self, id: &str, embedding: &[f32]) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE transcript_entries SET embedding = ?1 WHERE id = ?2",
                params![embedding_to_bytes(embedding), id],
            )?;
            Ok(())
        })
    }

    async fn missing_embeddings(&self, namespace: &str, limit: usize) -> Result<Vec<(String, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, content FROM transcript_entries
                 WHERE namespace = ?1 AND embedding IS NULL
                 ORDER BY created_at DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![namespace, limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    async fn semantic_search(&self, query: &[f32], k: usize, namespace: &str) -> Result<Vec<SemanticHit>> {
        if query.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            // vec_distance_cosine errors on a dimension mismatch, so filter on length first.
            let mut stmt = conn.prepare(
                "SELECT id, session_id, chunk_index, summary, confidence, similarity,
                        similarity * confidence AS score
                 FROM (
                     SELECT id, session_id, chunk_index, summary, confidence,
                            1.0 - vec_distance_cosine(embedding, ?1) AS similarity
                     FROM transcript_entries
                     WHERE namespace = ?2 AND embedding IS NOT NULL
                       AND length(embedding) = ?3
                 )
                 ORDER BY score DESC
                 LIMIT ?4",
            )?;
            let hits = stmt
                .query_map(
                    params![
                        embedding_to_bytes(query),
                        namespace,
                        (query.len() * 4) as i64,
                        k as i64
                    ],
                    |row| {
                        Ok(SemanticHit {
                            id: row.get(0)?,
                            session_id: row.get(1)?,
                            chunk_index: row.get(2)?,
                            summary: row.get(3)?,
                            confidence: row.get(4)?,
                            similarity: row.get::<_, f64>(5)? as f32,
                            score: row.get(6)?,
                        })
                    },
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(hits)
        })
    }

    async fn all_for_sync(&self, namespace: &str) -> Result<Vec<MemoryEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM transcript_entries
                 WHERE namespace = ?1 ORDER BY created_at ASC, chunk_index ASC"
            ))?;
            let rows = stmt
                .query_map([namespace], read_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(collect_entries(rows))
        })
    }
}
