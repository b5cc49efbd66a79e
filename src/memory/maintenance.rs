use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::config::{VaultConfig, ARCHIVE_NAMESPACE};
use crate::embedding::hash::HashEmbeddingProvider;
use crate::embedding::FallbackEmbedder;
use crate::storage::postgres::PostgresBackend;
use crate::storage::{BackendKind, StorageBackend};

// ── Result types ─────────────────────────────────────────────────────────────

/// Counts from one optimization pass, for the stderr summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OptimizeResult {
    pub decayed: usize,
    pub pruned: usize,
    pub embedded: usize,
    pub synced: usize,
}

impl OptimizeResult {
    /// ` Optimized: 2 pruned, 5 decayed.` or empty when nothing happened.
    pub fn summary(&self) -> String {
        let parts: Vec<String> = [
            (self.pruned, "pruned"),
            (self.decayed, "decayed"),
            (self.embedded, "embedded"),
            (self.synced, "synced"),
        ]
        .into_iter()
        .filter(|(n, _)| *n > 0)
        .map(|(n, label)| format!("{n} {label}"))
        .collect();
        if parts.is_empty() {
            String::new()
        } else {
            format!(" Optimized: {}.", parts.join(", "))
        }
    }
}

// ── Optimization pass ────────────────────────────────────────────────────────

/// Hours of decay owed since the last pass: at least one, at most `max_hours`.
pub fn decay_hours(last_optimized_at: Option<DateTime<Utc>>, now: DateTime<Utc>, max_hours: f64) -> f64 {
    let elapsed = last_optimized_at
        .map(|at| (now - at).num_milliseconds() as f64 / 3_600_000.0)
        .unwrap_or(1.0);
    elapsed.clamp(1.0, max_hours.max(1.0))
}

/// `now` minus `days`, or `None` when the window reaches past the
/// representable range.
pub fn retention_cutoff(now: DateTime<Utc>, days: u64) -> Option<DateTime<Utc>> {
    i64::try_from(days)
        .ok()
        .and_then(Duration::try_days)
        .and_then(|window| now.checked_sub_signed(window))
}

/// Decay, prune by confidence, prune by age, backfill vectors, mirror.
///
/// Confidence pruning runs before age pruning so a recent entry that decayed
/// to the floor is not spared just for being young. Every step is skipped
/// when the backend lacks it, and a failing step does not stop the next.
pub async fn optimize(
    backend: &dyn StorageBackend,
    embedder: &FallbackEmbedder,
    mirror: Option<&dyn StorageBackend>,
    config: &VaultConfig,
    hours: f64,
    now: DateTime<Utc>,
) -> OptimizeResult {
    let caps = backend.capabilities();
    let maintenance = &config.maintenance;
    let mut result = OptimizeResult::default();

    if caps.decay_confidence {
        result.decayed = step(
            "decay",
            backend.decay_confidence(ARCHIVE_NAMESPACE, maintenance.decay_per_hour, hours),
        )
        .await;
    }

    if caps.prune_by_confidence {
        result.pruned += step(
            "confidence prune",
            backend.prune_by_confidence(ARCHIVE_NAMESPACE, maintenance.prune_confidence),
        )
        .await;
    }

    if caps.prune_stale {
        match retention_cutoff(now, maintenance.retention_days) {
            Some(cutoff) => {
                result.pruned += step("age prune", backend.prune_stale(ARCHIVE_NAMESPACE, cutoff)).await;
            }
            None => tracing::warn!(
                retention_days = maintenance.retention_days,
                "retention window out of range, skipping age prune"
            ),
        }
    }

    if caps.store_embedding {
        result.embedded = step(
            "embedding backfill",
            backfill_embeddings(backend, embedder, maintenance.embed_batch),
        )
        .await;
    }

    if let Some(mirror) = mirror {
        if caps.all_for_sync {
            result.synced = step("mirror sync", sync_to_mirror(backend, mirror)).await;
        }
    }

    tracing::debug!(
        backend = %backend.kind(),
        decayed = result.decayed,
        pruned = result.pruned,
        embedded = result.embedded,
        synced = result.synced,
        hours,
        "optimization pass finished"
    );
    result
}

async fn step(name: &str, op: impl std::future::Future<Output = Result<usize>>) -> usize {
    match op.await {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!(step = name, error = %e, "optimization step failed");
            0
        }
    }
}

/// Embed up to `limit` archived turns that have no vector yet.
pub async fn backfill_embeddings(
    backend: &dyn StorageBackend,
    embedder: &FallbackEmbedder,
    limit: usize,
) -> Result<usize> {
    let pending = backend.missing_embeddings(ARCHIVE_NAMESPACE, limit).await?;
    let mut embedded = 0;
    for (id, content) in pending {
        let vector = embedder.embed(&content).vector;
        backend.store_embedding(&id, &vector).await?;
        embedded += 1;
    }
    Ok(embedded)
}

/// Copy the whole archive into `mirror`. Entries without a vector get a hash
/// projection so the mirror can search them. Returns rows new to the mirror.
pub async fn sync_to_mirror(primary: &dyn StorageBackend, mirror: &dyn StorageBackend) -> Result<usize> {
    let hash = HashEmbeddingProvider::default();
    let mut entries = primary.all_for_sync(ARCHIVE_NAMESPACE).await?;
    if entries.is_empty() {
        return Ok(0);
    }
    for entry in entries.iter_mut().filter(|e| e.embedding.is_none()) {
        entry.embedding = Some(hash.vector(&entry.content));
    }
    mirror.bulk_insert(&entries).await
}

/// The networked store as a sync target: only behind an embedded primary,
/// only when configured and reachable.
pub async fn open_mirror(config: &VaultConfig, primary: BackendKind) -> Option<Box<dyn StorageBackend>> {
    if primary != BackendKind::Sqlite {
        return None;
    }
    let mirror = PostgresBackend::new(config.postgres.clone()?);
    match mirror.initialize().await {
        Ok(()) => Some(Box::new(mirror)),
        Err(e) => {
            tracing::debug!(error = %e, "mirror unavailable, skipping sync");
            None
        }
    }
}
