//! Storage backends for archived turns.
//!
//! Every backend implements the required half of [`StorageBackend`]; the
//! optional operations default to [`StorageError::Unsupported`] and are
//! advertised through [`Capabilities`], which callers consult once after
//! [`resolve`] instead of probing per call.

pub mod append_log;
pub mod json_file;
pub mod postgres;
pub mod sqlite;

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::VaultConfig;
use crate::memory::types::{MemoryEntry, SemanticHit, SessionSummary};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{backend} backend does not support {capability}")]
    Unsupported {
        backend: BackendKind,
        capability: &'static str,
    },
    #[error("backend used before initialize()")]
    NotInitialized,
    #[error("backend is not configured")]
    NotConfigured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Sqlite,
    Postgres,
    AppendLog,
    Json,
}

impl BackendKind {
    /// Resolution order, most capable first.
    pub const CHAIN: [BackendKind; 4] = [
        BackendKind::Sqlite,
        BackendKind::Postgres,
        BackendKind::AppendLog,
        BackendKind::Json,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
            Self::AppendLog => "append-log",
            Self::Json => "json",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sqlite" => Ok(Self::Sqlite),
            "postgres" => Ok(Self::Postgres),
            "append-log" => Ok(Self::AppendLog),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown backend: {s}")),
        }
    }
}

/// Optional operations a backend actually implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    pub mark_accessed: bool,
    pub decay_confidence: bool,
    pub prune_by_confidence: bool,
    pub prune_stale: bool,
    pub query_by_importance: bool,
    /// Covers `store_embedding` and `missing_embeddings`.
    pub store_embedding: bool,
    pub semantic_search: bool,
    pub all_for_sync: bool,
}

impl Capabilities {
    pub const ALL: Capabilities = Capabilities {
        mark_accessed: true,
        decay_confidence: true,
        prune_by_confidence: true,
        prune_stale: true,
        query_by_importance: true,
        store_embedding: true,
        semantic_search: true,
        all_for_sync: true,
    };

    /// Names of the supported operations, for `status`.
    pub fn names(&self) -> Vec<&'static str> {
        [
            (self.mark_accessed, "markAccessed"),
            (self.decay_confidence, "decayConfidence"),
            (self.prune_by_confidence, "pruneByConfidence"),
            (self.prune_stale, "pruneStale"),
            (self.query_by_importance, "queryByImportance"),
            (self.store_embedding, "storeEmbedding"),
            (self.semantic_search, "semanticSearch"),
            (self.all_for_sync, "allForSync"),
        ]
        .into_iter()
        .filter_map(|(on, name)| on.then_some(name))
        .collect()
    }
}

/// Filters for [`StorageBackend::query`]. Results come newest first.
#[derive(Debug, Clone, Default)]
pub struct EntryQuery {
    pub namespace: Option<String>,
    pub session_id: Option<String>,
    pub limit: Option<usize>,
}

impl EntryQuery {
    pub fn namespace(namespace: &str) -> Self {
        Self {
            namespace: Some(namespace.to_string()),
            ..Self::default()
        }
    }
}

/// Epoch milliseconds as stored on disk. Out-of-range values read as the epoch.
pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn unsupported<T>(backend: BackendKind, capability: &'static str) -> Result<T> {
    Err(StorageError::Unsupported {
        backend,
        capability,
    }
    .into())
}

/// A persistence tier for [`MemoryEntry`] records.
///
/// Construction never touches disk or network; [`initialize`](Self::initialize)
/// does. `store` and `bulk_insert` skip any entry whose content hash already
/// exists in its namespace and never overwrite.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn capabilities(&self) -> Capabilities;

    /// File path or connection target, for diagnostics.
    fn location(&self) -> String;

    async fn initialize(&self) -> Result<()>;

    /// Returns `false` when the entry was a duplicate.
    async fn store(&self, entry: &MemoryEntry) -> Result<bool>;

    /// Insert a batch atomically where the backend can; returns how many were new.
    async fn bulk_insert(&self, entries: &[MemoryEntry]) -> Result<usize>;

    async fn query(&self, query: &EntryQuery) -> Result<Vec<MemoryEntry>>;

    /// A session's entries, highest chunk index first.
    async fn query_by_session(&self, namespace: &str, session_id: &str) -> Result<Vec<MemoryEntry>>;

    async fn count(&self, namespace: Option<&str>) -> Result<u64>;

    async fn list_namespaces(&self) -> Result<Vec<String>>;

    /// Sessions in a namespace, most recently written first.
    async fn list_sessions(&self, namespace: &str) -> Result<Vec<SessionSummary>>;

    async fn hash_exists(&self, namespace: &str, content_hash: &str) -> Result<bool>;

    /// Delete every entry in the namespace; returns how many were removed.
    async fn clear_namespace(&self, namespace: &str) -> Result<usize>;

    async fn shutdown(&self) -> Result<()>;

    /// Bump access count and confidence, stamp `last_accessed_at`.
    async fn mark_accessed(&self, _ids: &[String]) -> Result<usize> {
        unsupported(self.kind(), "markAccessed")
    }

    /// Lower confidence by `rate * hours`, floor-clamped. Returns rows changed.
    async fn decay_confidence(&self, _namespace: &str, _rate: f64, _hours: f64) -> Result<usize> {
        unsupported(self.kind(), "decayConfidence")
    }

    /// Delete never-accessed entries with confidence at or below `threshold`.
    async fn prune_by_confidence(&self, _namespace: &str, _threshold: f64) -> Result<usize> {
        unsupported(self.kind(), "pruneByConfidence")
    }

    /// Delete never-accessed entries created before `cutoff`.
    async fn prune_stale(&self, _namespace: &str, _cutoff: DateTime<Utc>) -> Result<usize> {
        unsupported(self.kind(), "pruneStale")
    }

    /// A session's entries with their importance at `now`, highest first.
    async fn query_by_importance(
        &self,
        _namespace: &str,
        _session_id: &str,
        _now: DateTime<Utc>,
    ) -> Result<Vec<(MemoryEntry, f64)>> {
        unsupported(self.kind(), "queryByImportance")
    }

    async fn store_embedding(&self, _id: &str, _embedding: &[f32]) -> Result<()> {
        unsupported(self.kind(), "storeEmbedding")
    }

    /// `(id, content)` of up to `limit` entries that have no vector yet.
    async fn missing_embeddings(&self, _namespace: &str, _limit: usize) -> Result<Vec<(String, String)>> {
        unsupported(self.kind(), "storeEmbedding")
    }

    /// Top `k` entries by similarity × confidence. Stored vectors whose
    /// dimension differs from the query never match.
    async fn semantic_search(&self, _query: &[f32], _k: usize, _namespace: &str) -> Result<Vec<SemanticHit>> {
        unsupported(self.kind(), "semanticSearch")
    }

    /// Every entry in the namespace, oldest first, with stored vectors.
    async fn all_for_sync(&self, _namespace: &str) -> Result<Vec<MemoryEntry>> {
        unsupported(self.kind(), "allForSync")
    }
}

/// Build a tier without touching anything. `None` when the tier is not
/// configured for this environment, or when `existing_only` is set and its
/// local file has not been created yet.
fn construct(kind: BackendKind, config: &VaultConfig, existing_only: bool) -> Option<Box<dyn StorageBackend>> {
    match kind {
        BackendKind::Sqlite => {
            let path = config.sqlite_path();
            (!existing_only || path.exists())
                .then(|| Box::new(sqlite::SqliteBackend::new(path)) as Box<dyn StorageBackend>)
        }
        BackendKind::Postgres => config
            .postgres
            .clone()
            .map(|pg| Box::new(postgres::PostgresBackend::new(pg)) as Box<dyn StorageBackend>),
        BackendKind::AppendLog => {
            let path = config.append_log_path();
            ((config.storage.append_log && !existing_only) || path.exists())
                .then(|| Box::new(append_log::AppendLogBackend::new(path)) as Box<dyn StorageBackend>)
        }
        BackendKind::Json => Some(Box::new(json_file::JsonFileBackend::new(config.json_path()))),
    }
}

async fn try_tier(kind: BackendKind, config: &VaultConfig, existing_only: bool) -> Result<Box<dyn StorageBackend>> {
    let backend = construct(kind, config, existing_only).ok_or(StorageError::NotConfigured)?;
    backend.initialize().await?;
    Ok(backend)
}

/// Walk the fallback chain and return the first backend that initializes.
///
/// `storage.backend` may pin a tier; the flat-file store remains the last
/// resort either way, so this never fails.
pub async fn resolve(config: &VaultConfig) -> Box<dyn StorageBackend> {
    resolve_with(config, false).await
}

/// Like [`resolve`], but never creates a local store: tiers whose file is
/// missing are skipped, ending at an empty, unwritten flat-file store.
pub async fn resolve_existing(config: &VaultConfig) -> Box<dyn StorageBackend> {
    resolve_with(config, true).await
}

async fn resolve_with(config: &VaultConfig, existing_only: bool) -> Box<dyn StorageBackend> {
    let pinned = match config.storage.backend.as_str() {
        "auto" => None,
        other => match other.parse::<BackendKind>() {
            Ok(kind) => Some(kind),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring storage.backend, resolving automatically");
                None
            }
        },
    };

    for kind in BackendKind::CHAIN {
        if kind == BackendKind::Json || pinned.is_some_and(|p| p != kind) {
            continue;
        }
        match try_tier(kind, config, existing_only).await {
            Ok(backend) => {
                tracing::debug!(backend = %kind, location = %backend.location(), "storage backend resolved");
                return backend;
            }
            Err(e) => tracing::debug!(backend = %kind, error = %e, "storage tier unavailable"),
        }
    }

    let backend = json_file::JsonFileBackend::new(config.json_path());
    if let Err(e) = backend.initialize().await {
        tracing::warn!(error = %e, "flat-file store failed to load, starting empty");
    }
    Box::new(backend)
}
