//! Deterministic, dependency-free embeddings.
//!
//! Each component `i` is a 32-bit rolling hash of the lower-cased, trimmed text
//! with every code unit weighted by `i + 1`, mapped through `(sin(h) + 1) / 2`.
//! Similar strings do not land near each other; this tier only keeps vector
//! search working when no learned model is available.

use anyhow::Result;

use super::{l2_normalize, EmbeddingProvider, EMBEDDING_DIM};

#[derive(Debug, Clone)]
pub struct HashEmbeddingProvider {
    dimensions: usize,
}

impl Default for HashEmbeddingProvider {
    fn default() -> Self {
        Self {
            dimensions: EMBEDDING_DIM,
        }
    }
}

impl HashEmbeddingProvider {
    pub fn with_dimensions(dimensions: usize) -> Self {
        Self { dimensions }
    }

    pub fn vector(&self, text: &str) -> Vec<f32> {
        let normalized = text.trim().to_lowercase();
        // UTF-16 code units keep vectors identical to ones written by other
        // producers of the same archive.
        let units: Vec<u16> = normalized.encode_utf16().collect();

        let raw: Vec<f32> = (0..self.dimensions)
            .map(|i| {
                let weight = i as i32 + 1;
                let hash = units.iter().fold(0i32, |h, &unit| {
                    h.wrapping_shl(5)
                        .wrapping_sub(h)
                        .wrapping_add((unit as i32).wrapping_mul(weight))
                });
                ((f64::from(hash).sin() + 1.0) / 2.0) as f32
            })
            .collect();

        l2_normalize(&raw)
    }
}

impl EmbeddingProvider for HashEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vector(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &'static str {
        "hash"
    }
}
