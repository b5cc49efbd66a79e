//! Tier 2: networked Postgres with pgvector.
//!
//! Only attempted when connection parameters are configured. Vectors travel
//! as pgvector text literals (`[0.1,0.2,...]`) cast with `::vector`, so no
//! client-side vector type is needed. The `embedding` column is
//! dimensionless; searches filter on `vector_dims` so learned and hash
//! vectors can share the table.

use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode};
use sqlx::Row;

use super::{from_millis, BackendKind, Capabilities, EntryQuery, StorageBackend, StorageError};
use crate::config::PostgresConfig;
use crate::memory::scoring::{ACCESS_BOOST, CONFIDENCE_CEILING, CONFIDENCE_FLOOR, HALF_LIFE_DAYS};
use crate::memory::types::{EntryMetadata, MemoryEntry, SemanticHit, SessionSummary};

const SCHEMA: [&str; 6] = [
    "CREATE TABLE IF NOT EXISTS transcript_entries (
        id TEXT PRIMARY KEY,
        key TEXT NOT NULL,
        content TEXT NOT NULL,
        namespace TEXT NOT NULL,
        tags JSONB NOT NULL DEFAULT '[]'::jsonb,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
        session_id TEXT NOT NULL,
        chunk_index INTEGER NOT NULL,
        summary TEXT NOT NULL DEFAULT '',
        content_hash TEXT NOT NULL,
        confidence DOUBLE PRECISION NOT NULL DEFAULT 0.8,
        access_count INTEGER NOT NULL DEFAULT 0,
        last_accessed_at BIGINT NOT NULL,
        created_at BIGINT NOT NULL,
        updated_at BIGINT NOT NULL,
        embedding vector
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_te_ns_hash ON transcript_entries(namespace, content_hash)",
    "CREATE INDEX IF NOT EXISTS idx_te_session ON transcript_entries(session_id, chunk_index)",
    "CREATE INDEX IF NOT EXISTS idx_te_namespace ON transcript_entries(namespace)",
    "CREATE INDEX IF NOT EXISTS idx_te_created ON transcript_entries(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_te_confidence ON transcript_entries(confidence)",
];

const ENTRY_COLUMNS: &str = "id, key, content, namespace, tags, metadata, confidence, access_count, \
    last_accessed_at, created_at, updated_at, embedding::text AS embedding_text";

const INSERT_SQL: &str = "INSERT INTO transcript_entries
    (id, key, content, namespace, tags, metadata, session_id, chunk_index, summary,
     content_hash, confidence, access_count, last_accessed_at, created_at, updated_at, embedding)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16::vector)
    ON CONFLICT (namespace, content_hash) DO NOTHING";

/// Entries older than this rank as if they were this old; Postgres raises on
/// `exp()` underflow instead of returning zero.
const MAX_RANKED_AGE_DAYS: f64 = 3650.0;

pub struct PostgresBackend {
    config: PostgresConfig,
    pool: OnceLock<PgPool>,
}

impl PostgresBackend {
    pub fn new(config: PostgresConfig) -> Self {
        Self {
            config,
            pool: OnceLock::new(),
        }
    }

    fn pool(&self) -> Result<&PgPool> {
        Ok(self.pool.get().ok_or(StorageError::NotInitialized)?)
    }

    fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.config.host)
            .port(self.config.port)
            .database(&self.config.database)
            .username(&self.config.user)
            .password(&self.config.password)
            .ssl_mode(if self.config.ssl {
                PgSslMode::Require
            } else {
                PgSslMode::Prefer
            })
    }
}

/// pgvector's text form.
pub fn vector_literal(v: &[f32]) -> String {
    let parts: Vec<String> = v.iter().map(|x| x.to_string()).collect();
    format!("[{}]", parts.join(","))
}

pub fn parse_vector_literal(s: &str) -> Option<Vec<f32>> {
    let inner = s.trim().strip_prefix('[')?.strip_suffix(']')?;
    if inner.trim().is_empty() {
        return Some(Vec::new());
    }
    inner.split(',').map(|p| p.trim().parse().ok()).collect()
}

fn entry_from_row(row: &PgRow) -> Result<MemoryEntry> {
    let metadata: serde_json::Value = row.try_get("metadata")?;
    let tags: serde_json::Value = row.try_get("tags")?;
    let embedding: Option<String> = row.try_get("embedding_text")?;
    Ok(MemoryEntry {
        id: row.try_get("id")?,
        key: row.try_get("key")?,
        content: row.try_get("content")?,
        namespace: row.try_get("namespace")?,
        tags: serde_json::from_value(tags).unwrap_or_default(),
        metadata: serde_json::from_value::<EntryMetadata>(metadata).context("malformed metadata")?,
        confidence: row.try_get("confidence")?,
        access_count: row.try_get::<i32, _>("access_count")?.max(0) as u32,
        last_accessed_at: from_millis(row.try_get("last_accessed_at")?),
        created_at: from_millis(row.try_get("created_at")?),
        updated_at: from_millis(row.try_get("updated_at")?),
        embedding: embedding.as_deref().and_then(parse_vector_literal),
    })
}

fn collect_entries(rows: &[PgRow]) -> Vec<MemoryEntry> {
    rows.iter()
        .filter_map(|row| match entry_from_row(row) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable row");
                None
            }
        })
        .collect()
}

async fn insert_entry<'e, E>(executor: E, entry: &MemoryEntry) -> Result<bool>
where
    E: sqlx::PgExecutor<'e>,
{
    let result = sqlx::query(INSERT_SQL)
        .bind(&entry.id)
        .bind(&entry.key)
        .bind(&entry.content)
        .bind(&entry.namespace)
        .bind(serde_json::to_value(&entry.tags)?)
        .bind(serde_json::to_value(&entry.metadata)?)
        .bind(&entry.metadata.session_id)
        .bind(entry.metadata.chunk_index as i32)
        .bind(&entry.metadata.summary)
        .bind(&entry.metadata.content_hash)
        .bind(entry.confidence)
        .bind(entry.access_count as i32)
        .bind(entry.last_accessed_at.timestamp_millis())
        .bind(entry.created_at.timestamp_millis())
        .bind(entry.updated_at.timestamp_millis())
        .bind(entry.embedding.as_deref().map(vector_literal))
        .execute(executor)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[async_trait]
impl StorageBackend for PostgresBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::ALL
    }

    fn location(&self) -> String {
        format!(
            "postgres://{}@{}:{}/{}",
            self.config.user, self.config.host, self.config.port, self.config.database
        )
    }

    async fn initialize(&self) -> Result<()> {
        let pool = PgPoolOptions::new()
            .max_connections(3)
            .acquire_timeout(Duration::from_secs(3))
            .connect_with(self.connect_options())
            .await
            .with_context(|| format!("failed to connect to {}", self.location()))?;

        // Needs superuser on first run; an installed extension is all that matters.
        if let Err(e) = sqlx::query("CREATE EXTENSION IF NOT EXISTS vector").execute(&pool).await {
            tracing::debug!(error = %e, "could not create pgvector extension");
        }
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .context("failed to prepare Postgres schema")?;
        }

        let _ = self.pool.set(pool);
        Ok(())
    }

    async fn store(&self, entry: &MemoryEntry) -> Result<bool> {
        insert_entry(self.pool()?, entry).await
    }

    async fn bulk_insert(&self, entries: &[MemoryEntry]) -> Result<usize> {
        let mut tx = self.pool()?.begin().await?;
        let mut inserted = 0;
        for entry in entries {
            // An error drops `tx`, which rolls the whole batch back.
            if insert_entry(&mut *tx, entry).await? {
                inserted += 1;
            }
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn query(&self, query: &EntryQuery) -> Result<Vec<MemoryEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM transcript_entries
             WHERE ($1::text IS NULL OR namespace = $1)
               AND ($2::text IS NULL OR session_id = $2)
             ORDER BY created_at DESC, chunk_index DESC
             LIMIT $3"
        );
        let rows = sqlx::query(&sql)
            .bind(query.namespace.as_deref())
            .bind(query.session_id.as_deref())
            .bind(query.limit.map(|l| l as i64))
            .fetch_all(self.pool()?)
            .await?;
        Ok(collect_entries(&rows))
    }

    async fn query_by_session(&self, namespace: &str, session_id: &str) -> Result<Vec<MemoryEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM transcript_entries
             WHERE namespace = $1 AND session_id = $2
             ORDER BY chunk_index DESC, created_at DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(namespace)
            .bind(session_id)
            .fetch_all(self.pool()?)
            .await?;
        Ok(collect_entries(&rows))
    }

    async fn count(&self, namespace: Option<&str>) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM transcript_entries WHERE ($1::text IS NULL OR namespace = $1)",
        )
        .bind(namespace)
        .fetch_one(self.pool()?)
        .await?;
        Ok(count as u64)
    }

    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT namespace FROM transcript_entries ORDER BY namespace")
                .fetch_all(self.pool()?)
                .await?;
        Ok(rows.into_iter().map(|(ns,)| ns).collect())
    }

    async fn list_sessions(&self, namespace: &str) -> Result<Vec<SessionSummary>> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT session_id, COUNT(*) FROM transcript_entries
             WHERE namespace = $1
             GROUP BY session_id
             ORDER BY MAX(created_at) DESC",
        )
        .bind(namespace)
        .fetch_all(self.pool()?)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(session_id, entries)| SessionSummary {
                session_id,
                entries: entries as u64,
            })
            .collect())
    }

    async fn hash_exists(&self, namespace: &str, content_hash: &str) -> Result<bool> {
        let found: Option<(i32,)> = sqlx::query_as(
            "SELECT 1 FROM transcript_entries WHERE namespace = $1 AND content_hash = $2 LIMIT 1",
        )
        .bind(namespace)
        .bind(content_hash)
        .fetch_optional(self.pool()?)
        .await?;
        Ok(found.is_some())
    }

    async fn clear_namespace(&self, namespace: &str) -> Result<usize> {
        let result = sqlx::query("DELETE FROM transcript_entries WHERE namespace = $1")
            .bind(namespace)
            .execute(self.pool()?)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
        Ok(())
    }

    async fn mark_accessed(&self, ids: &[String]) -> Result<usize> {
        let result = sqlx::query(
            "UPDATE transcript_entries
             SET access_count = access_count + 1,
                 last_accessed_at = $1,
                 confidence = LEAST($2, confidence + $3)
             WHERE id = ANY($4)",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(CONFIDENCE_CEILING)
        .bind(ACCESS_BOOST)
        .bind(ids)
        .execute(self.pool()?)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn decay_confidence(&self, namespace: &str, rate: f64, hours: f64) -> Result<usize> {
        let result = sqlx::query(
            "UPDATE transcript_entries SET confidence = GREATEST($1, confidence - $2)
             WHERE namespace = $3 AND confidence > $1",
        )
        .bind(CONFIDENCE_FLOOR)
        .bind(rate * hours.max(0.0))
        .bind(namespace)
        .execute(self.pool()?)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn prune_by_confidence(&self, namespace: &str, threshold: f64) -> Result<usize> {
        let result = sqlx::query(
            "DELETE FROM transcript_entries
             WHERE namespace = $1 AND confidence <= $2 AND access_count = 0",
        )
        .bind(namespace)
        .bind(threshold)
        .execute(self.pool()?)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn prune_stale(&self, namespace: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        let result = sqlx::query(
            "DELETE FROM transcript_entries
             WHERE namespace = $1 AND access_count = 0 AND created_at < $2",
        )
        .bind(namespace)
        .bind(cutoff.timestamp_millis())
        .execute(self.pool()?)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn query_by_importance(
        &self,
        namespace: &str,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<(MemoryEntry, f64)>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS},
                exp(-ln(2.0::float8)
                    * LEAST(GREATEST(($3 - created_at)::float8 / 86400000.0::float8, 0.0::float8), $4)
                    / $5)
                * (ln(access_count + 1.0::float8) / ln(2.0::float8) + 1.0::float8)
                * (1.0::float8
                   + CASE WHEN jsonb_array_length(COALESCE(metadata->'toolNames', '[]'::jsonb)) > 0
                          THEN 0.5::float8 ELSE 0.0::float8 END
                   + CASE WHEN jsonb_array_length(COALESCE(metadata->'filePaths', '[]'::jsonb)) > 0
                          THEN 0.3::float8 ELSE 0.0::float8 END) AS score
             FROM transcript_entries
             WHERE namespace = $1 AND session_id = $2
             ORDER BY score DESC, chunk_index DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(namespace)
            .bind(session_id)
            .bind(now.timestamp_millis())
            .bind(MAX_RANKED_AGE_DAYS)
            .bind(HALF_LIFE_DAYS)
            .fetch_all(self.pool()?)
            .await?;

        Ok(rows
            .iter()
            .filter_map(|row| {
                let score: f64 = row.try_get("score").ok()?;
                match entry_from_row(row) {
                    Ok(entry) => Some((entry, score)),
                    Err(e) => {
                        tracing::warn!(error = %e, "skipping unreadable row");
                        None
                    }
                }
            })
            .collect())
    }

    async fn store_embedding(&self, id: &str, embedding: &[f32]) -> Result<()> {
        sqlx::query("UPDATE transcript_entries SET embedding = $1::vector WHERE id = $2")
            .bind(vector_literal(embedding))
            .bind(id)
            .execute(self.pool()?)
            .await?;
        Ok(())
    }

    async fn missing_embeddings(&self, namespace: &str, limit: usize) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT id, content FROM transcript_entries
             WHERE namespace = $1 AND embedding IS NULL
             ORDER BY created_at DESC LIMIT $2",
        )
        .bind(namespace)
        .bind(limit as i64)
        .fetch_all(self.pool()?)
        .await?;
        Ok(rows)
    }

    async fn semantic_search(&self, query: &[f32], k: usize, namespace: &str) -> Result<Vec<SemanticHit>> {
        if query.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            "SELECT id, session_id, chunk_index, summary, confidence, similarity,
                    similarity * confidence AS score
             FROM (
                 SELECT id, session_id, chunk_index, summary, confidence,
                        (1.0 - (embedding <=> $1::vector))::float8 AS similarity
                 FROM transcript_entries
                 WHERE namespace = $2 AND embedding IS NOT NULL AND vector_dims(embedding) = $3
             ) candidates
             ORDER BY score DESC
             LIMIT $4",
        )
        .bind(vector_literal(query))
        .bind(namespace)
        .bind(query.len() as i32)
        .bind(k as i64)
        .fetch_all(self.pool()?)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(SemanticHit {
                    id: row.try_get("id")?,
                    session_id: row.try_get("session_id")?,
                    chunk_index: row.try_get::<i32, _>("chunk_index")?.max(0) as u32,
                    summary: row.try_get("summary")?,
                    confidence: row.try_get("confidence")?,
                    similarity: row.try_get::<f64, _>("similarity")? as f32,
                    score: row.try_get("score")?,
                })
            })
            .collect()
    }

    async fn all_for_sync(&self, namespace: &str) -> Result<Vec<MemoryEntry>> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM transcript_entries
             WHERE namespace = $1 ORDER BY created_at ASC, chunk_index ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(namespace)
            .fetch_all(self.pool()?)
            .await?;
        Ok(collect_entries(&rows))
    }
}
