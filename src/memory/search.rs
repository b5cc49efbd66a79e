//! Read path: budgeted restoration of a session's archive.
//!
//! Two renderings exist. [`restore_ranked`] orders by importance, reinforces
//! what it shows via `mark_accessed`, and appends related turns from other
//! sessions when the backend can search vectors. [`restore_recent`] lists the
//! newest turns first and leaves the archive untouched.
//!
//! Every byte of the result (header, lines, cross-session block and footer)
//! counts against the budget.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::scoring::rank_by_importance;
use super::types::{MemoryEntry, SemanticHit};
use crate::config::ARCHIVE_NAMESPACE;
use crate::embedding::{truncate_chars, FallbackEmbedder};
use crate::storage::StorageBackend;

const LINE_FILES: usize = 3;
const SESSION_PREFIX_CHARS: usize = 8;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreOutcome {
    /// Empty when nothing was archived for the session or nothing fit.
    pub text: String,
    /// Entries rendered into `text`, in render order.
    pub restored_ids: Vec<String>,
    pub total: usize,
    pub cross_session: usize,
}

/// Importance-ranked restoration with access reinforcement.
pub async fn restore_ranked(
    backend: &dyn StorageBackend,
    embedder: &FallbackEmbedder,
    session_id: &str,
    budget: usize,
    cross_session_hits: usize,
    now: DateTime<Utc>,
) -> Result<RestoreOutcome> {
    let ranked = ranked_entries(backend, session_id, now).await?;
    if ranked.is_empty() {
        return Ok(RestoreOutcome::default());
    }
    let total = ranked.len();

    let header = format!(
        "## Restored Context (importance-ranked from archive)\n\n\
         Previous conversation: {total} archived turns, ranked by importance:\n\n"
    );
    let lines = ranked
        .iter()
        .map(|(entry, score)| (entry.id.as_str(), format!("- [Turn {}, score:{score:.2}] {}", entry.chunk_index(), entry_body(entry))));
    let mut page = Page::fill(budget, &header, &footer(session_id, total, 0), lines);
    if page.ids.is_empty() {
        return Ok(RestoreOutcome::default());
    }

    let mut cross_session = 0;
    if backend.capabilities().semantic_search && cross_session_hits > 0 {
        let query = ranked[0].0.summary();
        if !query.is_empty() {
            let hits = related_sessions(backend, embedder, query, session_id, cross_session_hits).await;
            cross_session = page.append_related(budget, &hits);
        }
    }

    let ids: Vec<String> = page.ids.iter().map(|id| id.to_string()).collect();
    if backend.capabilities().mark_accessed {
        if let Err(e) = backend.mark_accessed(&ids).await {
            tracing::warn!(error = %e, "failed to mark restored entries accessed");
        }
    }

    let text = page.finish(&footer(session_id, total, ids.len()));
    Ok(RestoreOutcome {
        text,
        restored_ids: ids,
        total,
        cross_session,
    })
}

/// Recency-ordered restoration; no scores, no access marking.
pub async fn restore_recent(backend: &dyn StorageBackend, session_id: &str, budget: usize) -> Result<RestoreOutcome> {
    let entries = backend.query_by_session(ARCHIVE_NAMESPACE, session_id).await?;
    if entries.is_empty() {
        return Ok(RestoreOutcome::default());
    }
    let total = entries.len();

    let header = format!(
        "## Restored Context (from pre-compaction archive)\n\n\
         Previous conversation included {total} archived turns:\n\n"
    );
    let lines = entries
        .iter()
        .map(|entry| (entry.id.as_str(), format!("- [Turn {}] {}", entry.chunk_index(), entry_body(entry))));
    let page = Page::fill(budget, &header, &footer(session_id, total, 0), lines);
    if page.ids.is_empty() {
        return Ok(RestoreOutcome::default());
    }

    let ids: Vec<String> = page.ids.iter().map(|id| id.to_string()).collect();
    let text = page.finish(&footer(session_id, total, ids.len()));
    Ok(RestoreOutcome {
        text,
        restored_ids: ids,
        total,
        cross_session: 0,
    })
}

/// Native ranking when offered, otherwise the in-process scorer over the
/// session's entries (newest first, which the stable sort keeps for ties).
async fn ranked_entries(
    backend: &dyn StorageBackend,
    session_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<(MemoryEntry, f64)>> {
    if backend.capabilities().query_by_importance {
        match backend.query_by_importance(ARCHIVE_NAMESPACE, session_id, now).await {
            Ok(ranked) => return Ok(ranked),
            Err(e) => tracing::warn!(error = %e, "native ranking failed, scoring in process"),
        }
    }
    let entries = backend.query_by_session(ARCHIVE_NAMESPACE, session_id).await?;
    Ok(rank_by_importance(entries, now))
}

/// Semantic neighbours of `query` from sessions other than `session_id`.
/// Best effort: any failure yields no hits.
pub async fn related_sessions(
    backend: &dyn StorageBackend,
    embedder: &FallbackEmbedder,
    query: &str,
    session_id: &str,
    k: usize,
) -> Vec<SemanticHit> {
    let embedded = embedder.embed(query);
    match backend.semantic_search(&embedded.vector, k * 2, ARCHIVE_NAMESPACE).await {
        Ok(hits) => hits
            .into_iter()
            .filter(|hit| hit.session_id != session_id)
            .take(k)
            .collect(),
        Err(e) => {
            tracing::debug!(error = %e, "cross-session search unavailable");
            Vec::new()
        }
    }
}

/// `summary Tools: a, b. Files: x, y.`
fn entry_body(entry: &MemoryEntry) -> String {
    let meta = &entry.metadata;
    let mut body = if meta.summary.is_empty() {
        "(no summary)".to_string()
    } else {
        meta.summary.clone()
    };
    if !meta.tool_names.is_empty() {
        body.push_str(&format!(" Tools: {}.", meta.tool_names.join(", ")));
    }
    if !meta.file_paths.is_empty() {
        let files: Vec<&str> = meta.file_paths.iter().take(LINE_FILES).map(String::as_str).collect();
        body.push_str(&format!(" Files: {}.", files.join(", ")));
    }
    body
}

fn footer(session_id: &str, total: usize, shown: usize) -> String {
    format!(
        "\n\nFull archive: {ARCHIVE_NAMESPACE} namespace (session: {session_id}). {} additional turns available.",
        total - shown
    )
}

fn related_line(hit: &SemanticHit) -> String {
    let summary = if hit.summary.is_empty() { "(no summary)" } else { hit.summary.as_str() };
    format!(
        "- [Session {}..., turn {}, conf:{:.2}] {summary}",
        truncate_chars(&hit.session_id, SESSION_PREFIX_CHARS),
        hit.chunk_index,
        hit.confidence
    )
}

/// Text being assembled under a byte budget. `reserved` holds back room for
/// the widest footer, which is the one rendered when no line fits.
struct Page<'a> {
    body: String,
    ids: Vec<&'a str>,
    used: usize,
}

impl<'a> Page<'a> {
    fn fill(
        budget: usize,
        header: &str,
        widest_footer: &str,
        lines: impl Iterator<Item = (&'a str, String)>,
    ) -> Self {
        let mut page = Page {
            body: header.to_string(),
            ids: Vec::new(),
            used: header.len() + widest_footer.len(),
        };
        for (id, line) in lines {
            let sep = usize::from(!page.ids.is_empty());
            if page.used + sep + line.len() > budget {
                break;
            }
            if sep == 1 {
                page.body.push('\n');
            }
            page.body.push_str(&line);
            page.used += sep + line.len();
            page.ids.push(id);
        }
        page
    }

    /// Append as many related hits as fit; returns how many did.
    fn append_related(&mut self, budget: usize, hits: &[SemanticHit]) -> usize {
        let mut block = String::from("\n\nRelated context from previous sessions:");
        let mut added = 0;
        for hit in hits {
            let line = format!("\n{}", related_line(hit));
            if self.used + block.len() + line.len() > budget {
                break;
            }
            block.push_str(&line);
            added += 1;
        }
        if added > 0 {
            self.used += block.len();
            self.body.push_str(&block);
        }
        added
    }

    fn finish(mut self, footer: &str) -> String {
        self.body.push_str(footer);
        self.body
    }
}
