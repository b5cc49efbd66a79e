//! Context budget autopilot.
//!
//! Runs on every prompt: estimate usage, classify it against the warn and
//! prune thresholds, persist a short history, and say something only when
//! it matters. The warning advisory is issued once per session (re-armed by a
//! compaction); the critical advisory once per crossing of the prune
//! threshold, while the prune sweep runs on every critical tick.

pub mod estimate;
pub mod state;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{AutopilotConfig, ARCHIVE_NAMESPACE};
use crate::memory::maintenance::retention_cutoff;
use crate::storage::StorageBackend;
use estimate::UsageEstimate;
use state::{AutopilotState, HistorySample};

const BAR_WIDTH: usize = 20;
/// Growth assumed per turn when the history has no usable trend.
const FALLBACK_GROWTH: f64 = 0.03;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Status {
    Ok,
    Warning,
    Critical,
}

impl Status {
    pub fn classify(percentage: f64, config: &AutopilotConfig) -> Self {
        if percentage >= config.prune_pct {
            Self::Critical
        } else if percentage >= config.warn_pct {
            Self::Warning
        } else {
            Self::Ok
        }
    }

    fn fill(&self) -> char {
        match self {
            Self::Ok => '=',
            Self::Warning => '#',
            Self::Critical => '!',
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ok => "OK",
            Self::Warning => "WARNING",
            Self::Critical => "OPTIMIZING",
        })
    }
}

/// `[=======-------------]`, glyph by status.
pub fn progress_bar(percentage: f64, status: Status) -> String {
    let filled = ((percentage.clamp(0.0, 1.0) * BAR_WIDTH as f64).round() as usize).min(BAR_WIDTH);
    format!(
        "[{}{}]",
        status.fill().to_string().repeat(filled),
        "-".repeat(BAR_WIDTH - filled)
    )
}

/// `950`, `12.3K`, `1.5M`.
pub fn format_tokens(n: u64) -> String {
    if n >= 1_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.1}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

/// The gauge line shown to the model and in `status`.
pub fn report_line(state: &AutopilotState, turns: u32, config: &AutopilotConfig) -> String {
    let pct = state.last_percentage;
    let status = Status::classify(pct, config);
    let mut parts = vec![
        format!("[autopilot] {} {:.1}% context used", progress_bar(pct, status), pct * 100.0),
        format!(
            "(~{}/{} tokens, {turns} turns)",
            format_tokens(state.last_token_estimate),
            format_tokens(config.context_window)
        ),
        format!("Status: {status}"),
    ];
    if state.prune_count > 0 {
        parts.push(format!("| Optimizations: {} prune cycles", state.prune_count));
    }
    if let Some(turns_left) = state.turns_until(1.0) {
        parts.push(format!("| ~{turns_left} turns until optimization needed"));
    }
    parts.join(" ")
}

/// What one tick decided.
#[derive(Debug, Clone, Serialize)]
pub struct Tick {
    pub status: Status,
    pub percentage: f64,
    pub estimate: UsageEstimate,
    /// Gauge line followed by any advisories.
    pub context: String,
    pub pruned: usize,
    pub advised: bool,
}

/// Advance the state machine by one observation.
///
/// `backend` receives the critical prune sweep when it supports age pruning;
/// `None` skips the sweep.
pub async fn tick(
    state: &mut AutopilotState,
    session_id: &str,
    estimate: UsageEstimate,
    config: &AutopilotConfig,
    backend: Option<&dyn StorageBackend>,
    retention_days: u64,
    now: DateTime<Utc>,
) -> Tick {
    if state.session_id.as_deref() != Some(session_id) {
        state.reset_for_session(session_id);
    }
    if estimate.boundaries > state.compactions_seen {
        state.reset_after_compaction();
        state.compactions_seen = estimate.boundaries;
    }

    let window = config.context_window.max(1) as f64;
    let percentage = (estimate.tokens as f64 / window).min(1.0);
    state.record(
        HistorySample {
            ts: now,
            tokens: estimate.tokens,
            pct: percentage,
            turns: estimate.turns,
        },
        config.history_len,
    );

    let status = Status::classify(percentage, config);
    let mut messages = String::new();
    let mut pruned = 0;
    let mut advised = false;

    match status {
        Status::Ok => state.critical_issued = false,
        Status::Warning => {
            state.critical_issued = false;
            if !state.warning_issued {
                state.warning_issued = true;
                advised = true;
                messages.push_str(&format!(
                    " | Context at {:.0}%. Keep responses concise to extend session.",
                    percentage * 100.0
                ));
            }
        }
        Status::Critical => {
            state.prune_count += 1;
            if let Some(backend) = backend.filter(|b| b.capabilities().prune_stale) {
                let days = retention_days.min(config.critical_retention_days);
                match retention_cutoff(now, days) {
                    Some(cutoff) => match backend.prune_stale(ARCHIVE_NAMESPACE, cutoff).await {
                        Ok(n) => pruned = n,
                        Err(e) => tracing::warn!(error = %e, "critical prune sweep failed"),
                    },
                    None => tracing::warn!(days, "retention window out of range, skipping prune sweep"),
                }
            }
            if pruned > 0 {
                messages.push_str(&format!(" | Pruned {pruned} stale archive entries."));
            }
            if !state.critical_issued {
                state.critical_issued = true;
                advised = true;
                let turns_left = state
                    .turns_until(1.0)
                    .unwrap_or_else(|| ((1.0 - percentage) / FALLBACK_GROWTH).ceil().max(0.0) as u64);
                messages.push_str(&format!(
                    " | CRITICAL: {:.0}% context used (~{turns_left} turns left). All {} turns archived. \
                     Start a new session with /clear; context will be restored at session start.",
                    percentage * 100.0,
                    estimate.turns
                ));
            }
        }
    }

    let context = format!("{}{messages}", report_line(state, estimate.turns, config));
    tracing::debug!(
        session = session_id,
        tokens = estimate.tokens,
        method = %estimate.method,
        %status,
        pruned,
        "autopilot tick"
    );

    Tick {
        status,
        percentage,
        estimate,
        context,
        pruned,
        advised,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use estimate::EstimateMethod;

    fn estimate(tokens: u64) -> UsageEstimate {
        UsageEstimate {
            tokens,
            turns: 4,
            method: EstimateMethod::ApiUsage,
            boundaries: 0,
            pre_compaction_tokens: 0,
        }
    }

    #[test]
    fn classification_thresholds() {
        let config = AutopilotConfig::default();
        assert_eq!(Status::classify(0.69, &config), Status::Ok);
        assert_eq!(Status::classify(0.70, &config), Status::Warning);
        assert_eq!(Status::classify(0.85, &config), Status::Critical);
        assert_eq!(Status::Critical.to_string(), "OPTIMIZING");
    }

    #[test]
    fn bar_and_token_formatting() {
        assert_eq!(progress_bar(0.5, Status::Ok), "[==========----------]");
        assert_eq!(progress_bar(0.9, Status::Critical), "[!!!!!!!!!!!!!!!!!!--]");
        assert_eq!(progress_bar(1.7, Status::Critical).len(), 22);
        assert_eq!(format_tokens(950), "950");
        assert_eq!(format_tokens(12_345), "12.3K");
        assert_eq!(format_tokens(1_500_000), "1.5M");
    }

    #[tokio::test]
    async fn warning_is_issued_once() {
        let config = AutopilotConfig::default();
        let mut state = AutopilotState::default();
        let now = Utc::now();

        let first = tick(&mut state, "s", estimate(150_000), &config, None, 30, now).await;
        assert_eq!(first.status, Status::Warning);
        assert!(first.advised);
        assert!(first.context.contains("Keep responses concise"));

        let second = tick(&mut state, "s", estimate(152_000), &config, None, 30, now).await;
        assert!(!second.advised);
        assert!(second.context.starts_with("[autopilot] [###############-----] 76.0% context used"));
    }

    #[tokio::test]
    async fn new_session_resets_state() {
        let config = AutopilotConfig::default();
        let mut state = AutopilotState::default();
        let now = Utc::now();
        tick(&mut state, "a", estimate(150_000), &config, None, 30, now).await;
        assert!(state.warning_issued);

        let t = tick(&mut state, "b", estimate(150_000), &config, None, 30, now).await;
        assert!(t.advised);
        assert_eq!(state.session_id.as_deref(), Some("b"));
        assert_eq!(state.history.len(), 1);
    }

    #[tokio::test]
    async fn compaction_boundary_rearms_warning() {
        let config = AutopilotConfig::default();
        let mut state = AutopilotState::default();
        let now = Utc::now();
        tick(&mut state, "s", estimate(150_000), &config, None, 30, now).await;

        let mut after = estimate(145_000);
        after.boundaries = 1;
        let t = tick(&mut state, "s", after.clone(), &config, None, 30, now).await;
        assert!(t.advised);
        assert_eq!(state.compactions_seen, 1);

        let t = tick(&mut state, "s", after, &config, None, 30, now).await;
        assert!(!t.advised);
    }

    #[tokio::test]
    async fn critical_without_trend_falls_back_to_fixed_growth() {
        let config = AutopilotConfig::default();
        let mut state = AutopilotState::default();
        let t = tick(&mut state, "s", estimate(182_000), &config, None, 30, Utc::now()).await;
        assert_eq!(t.status, Status::Critical);
        // (1 - 0.91) / 0.03 rounds up to 3.
        assert!(t.context.contains("~3 turns left"), "{}", t.context);
        assert!(t.context.contains("Optimizations: 1 prune cycles"));
    }

    #[tokio::test]
    async fn unbounded_retention_skips_the_sweep() {
        use crate::memory::store::build_entry;
        use crate::memory::types::Trigger;
        use crate::storage::json_file::JsonFileBackend;
        use crate::transcript::{chunk::chunk_messages, messages_from_records};
        use serde_json::json;

        let dir = tempfile::TempDir::new().unwrap();
        let backend = JsonFileBackend::new(dir.path().join("a.json"));
        backend.initialize().await.unwrap();
        let now = Utc::now();
        let records = [
            json!({"role": "user", "content": "first"}),
            json!({"role": "assistant", "content": "done"}),
            json!({"role": "user", "content": "second"}),
            json!({"role": "assistant", "content": "done too"}),
        ];
        let entries: Vec<_> = chunk_messages(messages_from_records(&records), 500)
            .iter()
            .map(|t| build_entry("s", t, Trigger::Proactive, now))
            .collect();
        backend.bulk_insert(&entries).await.unwrap();

        let config = AutopilotConfig {
            critical_retention_days: u64::MAX,
            ..AutopilotConfig::default()
        };
        for retention in [1_000_000_000, u64::MAX] {
            let mut state = AutopilotState::default();
            let t = tick(&mut state, "s", estimate(190_000), &config, Some(&backend), retention, now).await;
            assert_eq!(t.status, Status::Critical);
            assert_eq!(t.pruned, 0);
            assert_eq!(state.prune_count, 1);
        }
        assert_eq!(backend.count(Some(ARCHIVE_NAMESPACE)).await.unwrap(), 2);
    }
}
