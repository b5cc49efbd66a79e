//! Archive record types.
//!
//! [`MemoryEntry`] is the unit every backend persists; its serde form (camelCase,
//! epoch-millisecond timestamps) is also the on-disk format of the flat-file
//! and append-log stores.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::scoring::INITIAL_CONFIDENCE;

/// What caused an archival run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// User-requested compaction.
    Manual,
    /// The host compacted because its window filled.
    Auto,
    /// Archived on every prompt, ahead of any compaction.
    Proactive,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Auto => "auto",
            Self::Proactive => "proactive",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "auto" => Ok(Self::Auto),
            "proactive" => Ok(Self::Proactive),
            _ => Err(format!("unknown trigger: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryMetadata {
    pub session_id: String,
    /// Turn ordinal within the session.
    pub chunk_index: u32,
    pub trigger: Trigger,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tool_names: Vec<String>,
    #[serde(default)]
    pub file_paths: Vec<String>,
    #[serde(default)]
    pub summary: String,
    pub content_hash: String,
    pub turn_range: (u32, u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryEntry {
    /// UUID v7, assigned at creation.
    pub id: String,
    /// `transcript:{session}:{turn}:{millis}`; informational, not unique.
    pub key: String,
    pub content: String,
    pub namespace: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub metadata: EntryMetadata,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default)]
    pub access_count: u32,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub last_accessed_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

fn default_confidence() -> f64 {
    INITIAL_CONFIDENCE
}

impl MemoryEntry {
    pub fn session_id(&self) -> &str {
        &self.metadata.session_id
    }

    pub fn chunk_index(&self) -> u32 {
        self.metadata.chunk_index
    }

    pub fn content_hash(&self) -> &str {
        &self.metadata.content_hash
    }

    pub fn summary(&self) -> &str {
        &self.metadata.summary
    }
}

/// One row of `list_sessions`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub entries: u64,
}

/// One semantic search result. `score` is similarity weighted by confidence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SemanticHit {
    pub id: String,
    pub session_id: String,
    pub chunk_index: u32,
    pub summary: String,
    pub confidence: f64,
    pub similarity: f32,
    pub score: f64,
}
