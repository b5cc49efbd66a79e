//! `archive-on-prompt`: proactive archival plus the autopilot gauge, on every
//! user prompt.

use std::path::Path;

use anyhow::Result;
use chrono::Utc;

use super::input::HookInput;
use super::{hook_payload, HookOutput};
use crate::autopilot::{self, estimate::estimate_records, format_tokens};
use crate::config::ARCHIVE_NAMESPACE;
use crate::context::EngineContext;
use crate::memory::store::{archive_turns, ArchiveResult};
use crate::memory::types::Trigger;
use crate::transcript::{chunk::chunk_messages, messages_from_records, read_records};

/// New turns tolerated before a proactive run bothers archiving.
pub const SKIP_TOLERANCE: usize = 2;

pub async fn archive_on_prompt(ctx: &EngineContext, input: &HookInput) -> Result<HookOutput> {
    let (Some(session_id), Some(transcript_path)) = (&input.session_id, &input.transcript_path) else {
        return Ok(HookOutput::silent());
    };

    let records = read_records(Path::new(transcript_path))?;
    let turns = chunk_messages(messages_from_records(&records), ctx.config.hooks.max_messages);
    if turns.is_empty() {
        return Ok(HookOutput::silent());
    }

    let backend = ctx.backend.as_ref();
    let mut stderr = Vec::new();
    let mut notes: Vec<String> = Vec::new();

    let existing = backend.query_by_session(ARCHIVE_NAMESPACE, session_id).await?.len();
    let archived = if existing > 0 && turns.len().saturating_sub(existing) <= SKIP_TOLERANCE {
        tracing::debug!(existing, turns = turns.len(), "archive is current, skipping");
        ArchiveResult::default()
    } else {
        let result = archive_turns(backend, session_id, &turns, Trigger::Proactive).await?;
        if result.stored > 0 {
            let total = backend.count(Some(ARCHIVE_NAMESPACE)).await?;
            notes.push(format!(
                "[ctxvault] Proactively archived {} turns (total: {total}).",
                result.stored
            ));
            stderr.push(format!(
                "[ctxvault] Proactive archive: {} new, {} deduped via {}. Total: {total}",
                result.stored,
                result.deduped,
                backend.kind()
            ));
        }
        result
    };

    if ctx.config.autopilot.enabled {
        let estimate = estimate_records(&records, ctx.config.autopilot.chars_per_token);
        let mut state = ctx.load_autopilot();
        let tick = autopilot::tick(
            &mut state,
            session_id,
            estimate,
            &ctx.config.autopilot,
            Some(backend),
            ctx.config.maintenance.retention_days,
            Utc::now(),
        )
        .await;
        ctx.save_autopilot(&state);

        stderr.push(format!(
            "[autopilot] {:.1}% context used (~{} tokens, {} turns, {})",
            tick.percentage * 100.0,
            format_tokens(tick.estimate.tokens),
            tick.estimate.turns,
            tick.estimate.method
        ));
        notes.push(tick.context);
    }

    let context = notes.join(" ");
    Ok(HookOutput {
        stdout: (!context.is_empty()).then(|| hook_payload("UserPromptSubmit", &context)),
        stderr,
        archived: Some(archived),
    })
}
