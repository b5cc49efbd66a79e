//! Text-to-vector embeddings with a degrading fallback chain.
//!
//! [`FallbackEmbedder`] prefers the learned ONNX model and drops to the
//! deterministic [`hash::HashEmbeddingProvider`] for the rest of the process
//! the first time the model cannot be loaded. Both tiers emit L2-normalized
//! vectors, so [`cosine_similarity`] is a dot product in practice.

pub mod hash;
pub mod local;

use std::fmt;
use std::sync::OnceLock;

use anyhow::Result;

use crate::config::EmbeddingConfig;
use hash::HashEmbeddingProvider;
use local::LearnedEmbeddingProvider;

/// Dimension shared by MiniLM and the hash projection.
pub const EMBEDDING_DIM: usize = 384;

/// Synchronous text embedder. Implementations return L2-normalized vectors.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddingMethod {
    Learned,
    Hash,
}

impl fmt::Display for EmbeddingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EmbeddingMethod::Learned => "learned",
            EmbeddingMethod::Hash => "hash",
        })
    }
}

#[derive(Debug, Clone)]
pub struct Embedded {
    pub vector: Vec<f32>,
    pub method: EmbeddingMethod,
}

/// Learned provider first, hash projection forever after it fails to load.
///
/// The learned tier is only attempted on first use, so invocations that never
/// embed never pay for loading the model.
pub struct FallbackEmbedder {
    config: EmbeddingConfig,
    learned: OnceLock<Option<LearnedEmbeddingProvider>>,
    hash: HashEmbeddingProvider,
}

impl FallbackEmbedder {
    pub fn new(config: EmbeddingConfig) -> Self {
        Self {
            config,
            learned: OnceLock::new(),
            hash: HashEmbeddingProvider::default(),
        }
    }

    /// An embedder that never tries the learned model.
    pub fn hash_only() -> Self {
        let embedder = Self::new(EmbeddingConfig {
            provider: "hash".into(),
            ..EmbeddingConfig::default()
        });
        let _ = embedder.learned.set(None);
        embedder
    }

    fn learned(&self) -> Option<&LearnedEmbeddingProvider> {
        self.learned
            .get_or_init(|| {
                if self.config.provider == "hash" {
                    return None;
                }
                match LearnedEmbeddingProvider::new(&self.config) {
                    Ok(provider) => Some(provider),
                    Err(e) => {
                        tracing::debug!(error = %e, "learned embeddings unavailable, using hash projection");
                        None
                    }
                }
            })
            .as_ref()
    }

    pub fn embed(&self, text: &str) -> Embedded {
        if let Some(provider) = self.learned() {
            match provider.embed(text) {
                Ok(vector) => {
                    return Embedded {
                        vector,
                        method: EmbeddingMethod::Learned,
                    }
                }
                Err(e) => tracing::warn!(error = %e, "learned embedding failed, using hash projection"),
            }
        }
        Embedded {
            vector: self.hash.vector(text),
            method: EmbeddingMethod::Hash,
        }
    }

    /// The method the next call will use, loading the model if not yet tried.
    pub fn method(&self) -> EmbeddingMethod {
        if self.learned().is_some() {
            EmbeddingMethod::Learned
        } else {
            EmbeddingMethod::Hash
        }
    }
}

/// Cosine similarity, or `None` when the vectors cannot be compared: different
/// lengths (learned and hash vectors may share a store), empty input, or a zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a * norm_b))
}

/// L2-normalize; a zero vector comes back unchanged.
pub fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}

/// Longest prefix of `s` with at most `max` chars.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
