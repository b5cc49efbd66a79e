//! Autopilot state persisted between hook invocations.
//!
//! Each invocation loads, updates and saves the file. Concurrent invocations
//! race last-writer-wins; the state is advisory, so a lost update only costs a
//! repeated or skipped message.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Samples averaged for the growth trend.
const TREND_WINDOW: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistorySample {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub ts: DateTime<Utc>,
    pub tokens: u64,
    pub pct: f64,
    pub turns: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutopilotState {
    pub session_id: Option<String>,
    pub last_token_estimate: u64,
    pub last_percentage: f64,
    pub prune_count: u32,
    pub warning_issued: bool,
    /// Set while above the prune threshold; cleared when usage drops below it.
    pub critical_issued: bool,
    /// Compaction boundaries already accounted for in this session.
    pub compactions_seen: u32,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub last_check: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub last_optimized_at: Option<DateTime<Utc>>,
    pub history: Vec<HistorySample>,
}

impl AutopilotState {
    /// Read the state file. Missing or unreadable files give a fresh state.
    pub fn load(path: &Path) -> Self {
        let Ok(contents) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        serde_json::from_str(&contents).unwrap_or_else(|e| {
            tracing::warn!(error = %e, path = %path.display(), "corrupt autopilot state, starting fresh");
            Self::default()
        })
    }

    /// Write via a temp file and rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }

    /// Forget everything measured so far and start tracking `session_id`.
    pub fn reset_for_session(&mut self, session_id: &str) {
        *self = Self {
            session_id: Some(session_id.to_string()),
            last_optimized_at: self.last_optimized_at,
            ..Self::default()
        };
    }

    /// Usage restarts from zero after a compaction boundary.
    pub fn reset_after_compaction(&mut self) {
        let session_id = self.session_id.take();
        let compactions_seen = self.compactions_seen;
        let last_optimized_at = self.last_optimized_at;
        *self = Self {
            session_id,
            compactions_seen,
            last_optimized_at,
            ..Self::default()
        };
    }

    /// Append a sample, dropping the oldest beyond `max_len`.
    pub fn record(&mut self, sample: HistorySample, max_len: usize) {
        self.last_token_estimate = sample.tokens;
        self.last_percentage = sample.pct;
        self.last_check = Some(sample.ts);
        self.history.push(sample);
        let excess = self.history.len().saturating_sub(max_len.max(1));
        self.history.drain(..excess);
    }

    /// Mean percentage growth per sample over the last few samples.
    pub fn growth_per_turn(&self) -> Option<f64> {
        if self.history.len() < 2 {
            return None;
        }
        let recent = &self.history[self.history.len().saturating_sub(TREND_WINDOW)..];
        let deltas: Vec<f64> = recent.windows(2).map(|w| w[1].pct - w[0].pct).collect();
        Some(deltas.iter().sum::<f64>() / deltas.len() as f64)
    }

    /// Turns until `limit` at the recent growth rate; `None` when usage is
    /// flat or shrinking.
    pub fn turns_until(&self, limit: f64) -> Option<u64> {
        let growth = self.growth_per_turn().filter(|g| *g > 0.0)?;
        Some(((limit - self.last_percentage).max(0.0) / growth).ceil() as u64)
    }
}
