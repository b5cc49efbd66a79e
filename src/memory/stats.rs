use anyhow::Result;
use serde::Serialize;

use super::types::SessionSummary;
use crate::config::ARCHIVE_NAMESPACE;
use crate::storage::{EntryQuery, StorageBackend};

/// Entries below this confidence are reported as fading.
pub const LOW_CONFIDENCE: f64 = 0.3;

/// Data behind the `status` report.
#[derive(Debug, Serialize)]
pub struct ArchiveStats {
    pub backend: String,
    pub location: String,
    pub capabilities: Vec<&'static str>,
    pub total_entries: u64,
    pub archived_entries: u64,
    pub namespaces: Vec<String>,
    pub sessions: Vec<SessionSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<ArchiveHealth>,
}

/// Vector coverage and confidence spread over the archive namespace.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchiveHealth {
    pub with_embedding: usize,
    pub average_confidence: f64,
    pub low_confidence: usize,
}

/// Gather status data. Read-only.
pub async fn archive_stats(backend: &dyn StorageBackend) -> Result<ArchiveStats> {
    let total_entries = backend.count(None).await?;
    let archived_entries = backend.count(Some(ARCHIVE_NAMESPACE)).await?;
    let namespaces = backend.list_namespaces().await?;
    let sessions = backend.list_sessions(ARCHIVE_NAMESPACE).await?;
    let health = if archived_entries > 0 {
        Some(archive_health(backend).await?)
    } else {
        None
    };

    Ok(ArchiveStats {
        backend: backend.kind().to_string(),
        location: backend.location(),
        capabilities: backend.capabilities().names(),
        total_entries,
        archived_entries,
        namespaces,
        sessions,
        health,
    })
}

async fn archive_health(backend: &dyn StorageBackend) -> Result<ArchiveHealth> {
    // Only the sync export carries vectors; plain queries leave them off.
    let entries = if backend.capabilities().all_for_sync {
        backend.all_for_sync(ARCHIVE_NAMESPACE).await?
    } else {
        backend.query(&EntryQuery::namespace(ARCHIVE_NAMESPACE)).await?
    };

    let n = entries.len().max(1) as f64;
    Ok(ArchiveHealth {
        with_embedding: entries.iter().filter(|e| e.embedding.is_some()).count(),
        average_confidence: entries.iter().map(|e| e.confidence).sum::<f64>() / n,
        low_confidence: entries.iter().filter(|e| e.confidence < LOW_CONFIDENCE).count(),
    })
}
