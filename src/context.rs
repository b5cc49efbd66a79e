//! Per-invocation engine context.
//!
//! Built once at the top of a hook run and passed down explicitly: the
//! resolved backend, the embedder (whose learned model loads on first use)
//! and the configuration they came from.

use crate::autopilot::state::AutopilotState;
use crate::config::VaultConfig;
use crate::embedding::FallbackEmbedder;
use crate::storage::{self, StorageBackend};

pub struct EngineContext {
    pub config: VaultConfig,
    pub backend: Box<dyn StorageBackend>,
    pub embedder: FallbackEmbedder,
}

impl EngineContext {
    /// Walk the storage fallback chain and set up embeddings.
    pub async fn resolve(config: VaultConfig) -> Self {
        let backend = storage::resolve(&config).await;
        Self::with_backend(config, backend)
    }

    /// Open whatever store already exists without creating one.
    pub async fn resolve_existing(config: VaultConfig) -> Self {
        let backend = storage::resolve_existing(&config).await;
        Self::with_backend(config, backend)
    }

    /// Use an already-initialized backend.
    pub fn with_backend(config: VaultConfig, backend: Box<dyn StorageBackend>) -> Self {
        let embedder = if config.embedding.provider == "hash" {
            FallbackEmbedder::hash_only()
        } else {
            FallbackEmbedder::new(config.embedding.clone())
        };
        Self {
            config,
            backend,
            embedder,
        }
    }

    pub fn load_autopilot(&self) -> AutopilotState {
        AutopilotState::load(&self.config.autopilot_state_path())
    }

    /// Best effort; a failed save only loses one observation.
    pub fn save_autopilot(&self, state: &AutopilotState) {
        if let Err(e) = state.save(&self.config.autopilot_state_path()) {
            tracing::warn!(error = %e, "failed to save autopilot state");
        }
    }

    pub async fn shutdown(self) {
        if let Err(e) = self.backend.shutdown().await {
            tracing::warn!(backend = %self.backend.kind(), error = %e, "backend shutdown failed");
        }
    }
}
