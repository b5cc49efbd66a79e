//! `ctxvault status`: read-only diagnostic report.

use std::fmt::Write;

use anyhow::Result;

use crate::autopilot::{format_tokens, report_line};
use crate::context::EngineContext;
use crate::memory::stats::{archive_stats, LOW_CONFIDENCE};

const MAX_SESSIONS_SHOWN: usize = 10;

/// Render the status report. Reads the archive and autopilot state, writes neither.
pub async fn status_report(ctx: &EngineContext) -> Result<String> {
    let stats = archive_stats(ctx.backend.as_ref()).await?;
    let config = &ctx.config;
    let mut out = String::new();

    writeln!(out, "ctxvault Archive Status")?;
    writeln!(out, "{}", "=".repeat(40))?;
    writeln!(out, "  Backend:           {} ({})", stats.backend, stats.location)?;
    let caps = if stats.capabilities.is_empty() {
        "(required operations only)".to_string()
    } else {
        stats.capabilities.join(", ")
    };
    writeln!(out, "  Capabilities:      {caps}")?;
    writeln!(out, "  Total entries:     {}", stats.total_entries)?;
    writeln!(out, "  Archived turns:    {}", stats.archived_entries)?;
    let namespaces = if stats.namespaces.is_empty() {
        "(none)".to_string()
    } else {
        stats.namespaces.join(", ")
    };
    writeln!(out, "  Namespaces:        {namespaces}")?;
    writeln!(out, "  Restore budget:    {} chars", config.retrieval.restore_budget)?;
    writeln!(out)?;

    writeln!(out, "Sessions: {}", stats.sessions.len())?;
    for session in stats.sessions.iter().take(MAX_SESSIONS_SHOWN) {
        writeln!(out, "  {:<40} {} turns", session.session_id, session.entries)?;
    }
    if stats.sessions.len() > MAX_SESSIONS_SHOWN {
        writeln!(out, "  ... and {} more", stats.sessions.len() - MAX_SESSIONS_SHOWN)?;
    }
    writeln!(out)?;

    writeln!(out, "Maintenance:")?;
    let optimize = if config.maintenance.auto_optimize { "on" } else { "off" };
    writeln!(out, "  Auto-optimize:     {optimize}")?;
    writeln!(out, "  Retention:         {} days", config.maintenance.retention_days)?;
    let mirror = match &config.postgres {
        Some(pg) => format!("{}@{}:{}/{}", pg.user, pg.host, pg.port, pg.database),
        None => "not configured".to_string(),
    };
    writeln!(out, "  Postgres:          {mirror}")?;
    if let Some(health) = &stats.health {
        writeln!(
            out,
            "  Embeddings:        {}/{} entries",
            health.with_embedding, stats.archived_entries
        )?;
        writeln!(out, "  Avg confidence:    {:.3}", health.average_confidence)?;
        writeln!(out, "  Below {LOW_CONFIDENCE}:         {}", health.low_confidence)?;
    }
    writeln!(out)?;

    let ap = &config.autopilot;
    writeln!(out, "Autopilot:")?;
    writeln!(out, "  Enabled:           {}", if ap.enabled { "yes" } else { "no" })?;
    writeln!(
        out,
        "  Window:            {} tokens (warn {:.0}%, prune {:.0}%)",
        format_tokens(ap.context_window),
        ap.warn_pct * 100.0,
        ap.prune_pct * 100.0
    )?;
    let state = ctx.load_autopilot();
    match &state.session_id {
        Some(session) => {
            let turns = state.history.last().map(|s| s.turns).unwrap_or(0);
            writeln!(out, "  Session:           {session}")?;
            writeln!(out, "  {}", report_line(&state, turns, ap))?;
            writeln!(out, "  Prune cycles:      {}", state.prune_count)?;
            if let Some(turns_left) = state.turns_until(ap.prune_pct) {
                writeln!(out, "  Runway:            ~{turns_left} turns until prune threshold")?;
            }
        }
        None => writeln!(out, "  No readings yet.")?,
    }

    Ok(out)
}
