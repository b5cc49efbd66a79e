//! `archive-before-compaction`: the safety net run just before the host
//! compacts. Archives every turn, optimizes, and prints guidance for the
//! host's summarizer on stdout.

use std::path::Path;

use anyhow::Result;
use chrono::Utc;

use super::input::HookInput;
use super::HookOutput;
use crate::autopilot::{progress_bar, Status};
use crate::config::ARCHIVE_NAMESPACE;
use crate::context::EngineContext;
use crate::memory::guidance::compaction_guidance;
use crate::memory::maintenance::{decay_hours, open_mirror, optimize, OptimizeResult};
use crate::memory::store::archive_turns;
use crate::memory::types::Trigger;
use crate::transcript::{chunk::chunk_messages, read_transcript};

pub async fn archive_before_compaction(ctx: &EngineContext, input: &HookInput) -> Result<HookOutput> {
    let (Some(session_id), Some(transcript_path)) = (&input.session_id, &input.transcript_path) else {
        return Ok(HookOutput::silent());
    };

    let messages = read_transcript(Path::new(transcript_path))?;
    let turns = chunk_messages(messages, ctx.config.hooks.max_messages);
    if turns.is_empty() {
        return Ok(HookOutput::silent());
    }

    let trigger = input
        .trigger
        .as_deref()
        .and_then(|t| t.parse::<Trigger>().ok())
        .unwrap_or(Trigger::Auto);

    let backend = ctx.backend.as_ref();
    let archived = archive_turns(backend, session_id, &turns, trigger).await?;

    let optimized = if ctx.config.maintenance.auto_optimize {
        run_optimize(ctx).await
    } else {
        OptimizeResult::default()
    };

    let total = backend.count(Some(ARCHIVE_NAMESPACE)).await?;
    let mut stderr = vec![format!(
        "[ctxvault] Archived {} turns ({} deduped) via {}. Total: {total}.{}",
        archived.stored,
        archived.deduped,
        backend.kind(),
        optimized.summary()
    )];

    if ctx.config.autopilot.enabled {
        let mut state = ctx.load_autopilot();
        let pct = state.last_percentage;
        let status = Status::classify(pct, &ctx.config.autopilot);
        stderr.push(format!(
            "[autopilot] {} {:.1}% | {trigger} compact, {} turns archived. Context will be restored after compaction.",
            progress_bar(pct, status),
            pct * 100.0,
            turns.len()
        ));
        state.reset_after_compaction();
        ctx.save_autopilot(&state);
    }

    let guidance = compaction_guidance(&turns, session_id, archived, ctx.config.retrieval.guidance_budget);
    Ok(HookOutput {
        stdout: Some(guidance),
        stderr,
        archived: Some(archived),
    })
}

/// Optimize with decay owed since the last recorded pass, then record this one.
pub async fn run_optimize(ctx: &EngineContext) -> OptimizeResult {
    let now = Utc::now();
    let mut state = ctx.load_autopilot();
    let hours = decay_hours(state.last_optimized_at, now, ctx.config.maintenance.max_decay_hours);

    let mirror = open_mirror(&ctx.config, ctx.backend.kind()).await;
    let result = optimize(
        ctx.backend.as_ref(),
        &ctx.embedder,
        mirror.as_deref(),
        &ctx.config,
        hours,
        now,
    )
    .await;
    if let Some(mirror) = mirror {
        if let Err(e) = mirror.shutdown().await {
            tracing::debug!(error = %e, "mirror shutdown failed");
        }
    }

    state.last_optimized_at = Some(now);
    ctx.save_autopilot(&state);
    result
}
