mod helpers;

use ctxvault::cli::prompt::archive_on_prompt;
use ctxvault::config::ARCHIVE_NAMESPACE;
use helpers::*;
use serde_json::Value;
use tempfile::TempDir;

#[tokio::test]
async fn one_new_turn_is_within_tolerance() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), "sqlite");
    let transcript = write_transcript(dir.path(), 5);
    let input = hook_input("sess-p", &transcript);

    let ctx = context(&config).await;
    let first = archive_on_prompt(&ctx, &input).await.unwrap();
    assert_eq!(first.archived.unwrap().stored, 5);
    let before = ctx.backend.count(Some(ARCHIVE_NAMESPACE)).await.unwrap();
    ctx.shutdown().await;

    append_records(&transcript, &turn_records(5));

    let ctx = context(&config).await;
    let second = archive_on_prompt(&ctx, &input).await.unwrap();
    assert_eq!(second.archived.unwrap().stored, 0);
    let after = ctx.backend.count(Some(ARCHIVE_NAMESPACE)).await.unwrap();
    assert!(after - before <= 1, "grew from {before} to {after}");
}

#[tokio::test]
async fn archives_again_once_tolerance_is_exceeded() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), "sqlite");
    let transcript = write_transcript(dir.path(), 2);
    let input = hook_input("sess-q", &transcript);
    let ctx = context(&config).await;

    archive_on_prompt(&ctx, &input).await.unwrap();
    for i in 2..5 {
        append_records(&transcript, &turn_records(i));
    }
    let out = archive_on_prompt(&ctx, &input).await.unwrap();

    // The formerly last turn is unchanged, so only the three new ones land.
    assert_eq!(out.archived.unwrap().stored, 3);
    assert_eq!(ctx.backend.count(Some(ARCHIVE_NAMESPACE)).await.unwrap(), 5);
}

#[tokio::test]
async fn payload_carries_archive_note_and_gauge() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), "sqlite");
    let transcript = write_transcript(dir.path(), 3);
    let ctx = context(&config).await;

    let out = archive_on_prompt(&ctx, &hook_input("sess-r", &transcript))
        .await
        .unwrap();
    let payload: Value = serde_json::from_str(out.stdout.as_deref().unwrap()).unwrap();
    assert_eq!(payload["hookSpecificOutput"]["hookEventName"], "UserPromptSubmit");
    let text = payload["hookSpecificOutput"]["additionalContext"].as_str().unwrap();
    assert!(text.starts_with("[ctxvault] Proactively archived 3 turns (total: 3)."));
    assert!(text.contains("[autopilot] ["));
    assert!(text.contains("Status: OK"));
    assert!(out.stderr.iter().any(|l| l.starts_with("[autopilot]")));
}

#[tokio::test]
async fn quiet_when_nothing_new_and_autopilot_off() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path(), "sqlite");
    config.autopilot.enabled = false;
    let transcript = write_transcript(dir.path(), 3);
    let input = hook_input("sess-s", &transcript);
    let ctx = context(&config).await;

    assert!(archive_on_prompt(&ctx, &input).await.unwrap().stdout.is_some());
    let again = archive_on_prompt(&ctx, &input).await.unwrap();
    assert!(again.stdout.is_none());
    assert!(!config.autopilot_state_path().exists());
}

#[tokio::test]
async fn missing_fields_are_a_no_op() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), "sqlite");
    let ctx = context(&config).await;

    let out = archive_on_prompt(&ctx, &session_start("sess-t", "compact"))
        .await
        .unwrap();
    assert!(out.stdout.is_none());
    assert!(out.archived.is_none());
}
