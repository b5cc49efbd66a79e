//! Lossless context archival for assistant compaction hooks.
//!
//! The host runtime periodically compacts its conversation to fit a token
//! budget. ctxvault runs as a short-lived hook process around that event:
//! before compaction it archives every turn, after it restores a ranked,
//! budgeted summary, and on every prompt it archives proactively and reports
//! how close the context is to the limit.
//!
//! # Architecture
//!
//! - **Storage**: a fallback chain of backends behind one capability-flagged
//!   trait. SQLite (WAL, [sqlite-vec](https://github.com/asg017/sqlite-vec)
//!   for cosine search), then Postgres with pgvector, then an append-only
//!   journal, then a flat JSON file that always works
//! - **Embeddings**: local ONNX Runtime with all-MiniLM-L6-v2 (384 dimensions),
//!   degrading to a deterministic hash projection
//! - **Ranking**: importance from recency, access frequency and structural
//!   richness; confidence decays hourly and is boosted on restore
//! - **Autopilot**: token usage read from the transcript's API usage figures
//!
//! # Modules
//!
//! - [`config`]: TOML file plus environment overrides
//! - [`transcript`]: transcript reading, turn chunking, structural extraction
//! - [`storage`]: backend trait, capabilities and resolution chain
//! - [`db`]: SQLite connection setup, schema and migrations
//! - [`embedding`]: learned and hash embedding providers
//! - [`memory`]: archive, restore, optimize, guidance and stats
//! - [`autopilot`]: usage estimation and the threshold state machine
//! - [`context`]: the per-invocation engine context
//! - [`cli`]: subcommand bodies

pub mod autopilot;
pub mod cli;
pub mod config;
pub mod context;
pub mod db;
pub mod embedding;
pub mod memory;
pub mod storage;
pub mod transcript;
