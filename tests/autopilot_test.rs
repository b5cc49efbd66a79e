mod helpers;

use chrono::{Duration, Utc};
use ctxvault::cli::prompt::archive_on_prompt;
use ctxvault::config::{VaultConfig, ARCHIVE_NAMESPACE};
use ctxvault::memory::store::build_entry;
use ctxvault::memory::types::{MemoryEntry, Trigger};
use ctxvault::transcript::{chunk::chunk_messages, messages_from_records};
use helpers::*;
use std::path::Path;
use tempfile::TempDir;

/// Report `tokens` of usage and run one prompt hook in a fresh context.
async fn prompt_at(config: &VaultConfig, transcript: &Path, tokens: u64) -> String {
    append_records(transcript, &[usage_record(tokens)]);
    let ctx = context(config).await;
    let out = archive_on_prompt(&ctx, &hook_input("live", transcript))
        .await
        .unwrap();
    ctx.shutdown().await;
    additional_context(&out.stdout.unwrap())
}

fn stale_entries(days_old: i64) -> Vec<MemoryEntry> {
    let records: Vec<_> = (100..103).flat_map(turn_records).collect();
    let then = Utc::now() - Duration::days(days_old);
    chunk_messages(messages_from_records(&records), 500)
        .iter()
        .map(|turn| build_entry("old-session", turn, Trigger::Auto, then))
        .collect()
}

#[tokio::test]
async fn critical_advisory_once_per_crossing_with_prune_sweep() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), "sqlite");
    let transcript = write_transcript(dir.path(), 4);

    let ctx = context(&config).await;
    ctx.backend.bulk_insert(&stale_entries(10)).await.unwrap();
    ctx.shutdown().await;

    let calm = prompt_at(&config, &transcript, 100_000).await;
    assert!(calm.contains("Status: OK"));
    assert!(!calm.contains("CRITICAL"));

    let warned = prompt_at(&config, &transcript, 150_000).await;
    assert!(warned.contains("Status: WARNING"));
    assert!(warned.contains("Context at 75%"));
    assert!(!prompt_at(&config, &transcript, 160_000).await.contains("Context at"));

    let critical = prompt_at(&config, &transcript, 175_000).await;
    assert_eq!(critical.matches("CRITICAL").count(), 1);
    assert!(critical.contains("Status: OPTIMIZING"));
    assert!(critical.contains("Pruned 3 stale archive entries."));

    let still = prompt_at(&config, &transcript, 180_000).await;
    assert!(still.contains("Status: OPTIMIZING"));
    assert!(!still.contains("CRITICAL"));
    assert!(still.contains("| Optimizations: 2 prune cycles"));

    let ctx = context(&config).await;
    let left = ctx.backend.count(Some(ARCHIVE_NAMESPACE)).await.unwrap();
    let state = ctx.load_autopilot();
    ctx.shutdown().await;
    // The live session's four turns survive; only week-old entries went.
    assert_eq!(left, 4);
    assert_eq!(state.prune_count, 2);
    assert!(state.critical_issued);

    // Dropping below the threshold re-arms the advisory.
    assert!(!prompt_at(&config, &transcript, 120_000).await.contains("CRITICAL"));
    let recrossed = prompt_at(&config, &transcript, 176_000).await;
    assert_eq!(recrossed.matches("CRITICAL").count(), 1);
}

#[tokio::test]
async fn compaction_boundary_rearms_the_gauge() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), "sqlite");
    let transcript = write_transcript(dir.path(), 2);

    assert!(prompt_at(&config, &transcript, 150_000).await.contains("Context at 75%"));

    append_records(
        &transcript,
        &[serde_json::json!({"type": "system", "subtype": "compact_boundary",
            "compactMetadata": {"trigger": "auto", "preTokens": 150_000}})],
    );
    let after = prompt_at(&config, &transcript, 146_000).await;
    assert!(after.contains("Context at 73%"));

    let ctx = context(&config).await;
    let state = ctx.load_autopilot();
    assert_eq!(state.compactions_seen, 1);
    assert_eq!(state.session_id.as_deref(), Some("live"));
}

#[tokio::test]
async fn new_session_starts_a_fresh_gauge() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), "sqlite");
    let transcript = write_transcript(dir.path(), 2);
    prompt_at(&config, &transcript, 175_000).await;

    let ctx = context(&config).await;
    let out = archive_on_prompt(&ctx, &hook_input("another", &transcript))
        .await
        .unwrap();
    let text = additional_context(&out.stdout.unwrap());
    assert!(text.contains("CRITICAL"));
    assert!(text.contains("| Optimizations: 1 prune cycles"));
}
