//! `restore-after-start`: re-inject archived context once a session restarts
//! after a compaction or a `/clear`.

use anyhow::Result;
use chrono::Utc;

use super::input::HookInput;
use super::{hook_payload, HookOutput};
use crate::context::EngineContext;
use crate::memory::search::{restore_ranked, restore_recent};

/// Session sources that lost context.
const RESTORING_SOURCES: [&str; 2] = ["compact", "clear"];

pub async fn restore_after_start(ctx: &EngineContext, input: &HookInput) -> Result<HookOutput> {
    if !input
        .source
        .as_deref()
        .is_some_and(|s| RESTORING_SOURCES.contains(&s))
    {
        return Ok(HookOutput::silent());
    }
    let Some(session_id) = &input.session_id else {
        return Ok(HookOutput::silent());
    };

    let backend = ctx.backend.as_ref();
    let budget = ctx.config.retrieval.restore_budget;
    let mut stderr = Vec::new();

    let outcome = if ctx.config.maintenance.auto_optimize {
        let outcome = restore_ranked(
            backend,
            &ctx.embedder,
            session_id,
            budget,
            ctx.config.retrieval.cross_session_hits,
            Utc::now(),
        )
        .await?;
        if !outcome.restored_ids.is_empty() {
            stderr.push(format!(
                "[ctxvault] Smart restore: {} turns (importance-ranked) via {}",
                outcome.restored_ids.len(),
                backend.kind()
            ));
        }
        outcome
    } else {
        restore_recent(backend, session_id, budget).await?
    };

    if outcome.text.is_empty() {
        return Ok(HookOutput {
            stderr,
            ..HookOutput::silent()
        });
    }
    Ok(HookOutput {
        stdout: Some(hook_payload("SessionStart", &outcome.text)),
        stderr,
        archived: None,
    })
}
