//! Learned embeddings: all-MiniLM-L6-v2 through ONNX Runtime.
//!
//! Tokenize, run the encoder, mean-pool the token states under the attention
//! mask, then L2-normalize.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::Tokenizer;

use super::{l2_normalize, truncate_chars, EmbeddingProvider, EMBEDDING_DIM};
use crate::config::EmbeddingConfig;

/// The model was trained at 256 tokens; longer inputs are cut by the tokenizer.
const MAX_SEQ_LEN: usize = 256;

pub struct LearnedEmbeddingProvider {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    max_input_chars: usize,
}

// Tokenizer is Send + Sync and the session is only touched under the mutex.
unsafe impl Send for LearnedEmbeddingProvider {}
unsafe impl Sync for LearnedEmbeddingProvider {}

/// Paths of the two files `ctxvault model download` fetches.
pub fn model_files(config: &EmbeddingConfig) -> (PathBuf, PathBuf) {
    let dir = crate::config::expand_tilde(&config.cache_dir);
    (dir.join("model.onnx"), dir.join("tokenizer.json"))
}

impl LearnedEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let (model_path, tokenizer_path) = model_files(config);
        for path in [&model_path, &tokenizer_path] {
            anyhow::ensure!(
                path.exists(),
                "{} not found. Run `ctxvault model download` first.",
                path.display()
            );
        }

        let session = load_session(&model_path)?;
        let tokenizer = load_tokenizer(&tokenizer_path)?;
        tracing::debug!(model = %config.model, "learned embedding provider ready");

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            max_input_chars: config.max_input_chars,
        })
    }

    fn encode(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let inputs: Vec<&str> = texts
            .iter()
            .map(|t| truncate_chars(t, self.max_input_chars))
            .collect();
        let encodings = self
            .tokenizer
            .encode_batch(inputs, true)
            .map_err(|e| anyhow::anyhow!("tokenization failed: {e}"))?;

        let batch = encodings.len();
        let seq_len = encodings.first().map(|e| e.get_ids().len()).unwrap_or(0);

        let ids: Vec<i64> = encodings
            .iter()
            .flat_map(|e| e.get_ids().iter().map(|&id| id as i64))
            .collect();
        let mask: Vec<i64> = encodings
            .iter()
            .flat_map(|e| e.get_attention_mask().iter().map(|&m| m as i64))
            .collect();

        let shape = vec![batch as i64, seq_len as i64];
        let ids_tensor = Tensor::from_array((shape.clone(), ids.into_boxed_slice()))?;
        let mask_tensor = Tensor::from_array((shape.clone(), mask.clone().into_boxed_slice()))?;
        let type_tensor =
            Tensor::from_array((shape, vec![0i64; batch * seq_len].into_boxed_slice()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow::anyhow!("session lock poisoned: {e}"))?;
        let outputs = session.run(ort::inputs! {
            "input_ids" => ids_tensor,
            "attention_mask" => mask_tensor,
            "token_type_ids" => type_tensor,
        })?;

        // Export names differ between conversions of the same model.
        let hidden = outputs
            .get("token_embeddings")
            .or_else(|| outputs.get("last_hidden_state"))
            .unwrap_or_else(|| &outputs[0]);
        let (shape, data) = hidden
            .try_extract_tensor::<f32>()
            .context("failed to extract token embeddings")?;
        let dims: &[i64] = &shape;
        anyhow::ensure!(
            dims.len() == 3 && dims[2] == EMBEDDING_DIM as i64,
            "unexpected token embedding shape {dims:?}"
        );
        let out_seq = dims[1] as usize;

        Ok((0..batch)
            .map(|b| {
                let pooled = mean_pool(
                    &data[b * out_seq * EMBEDDING_DIM..(b + 1) * out_seq * EMBEDDING_DIM],
                    &mask[b * seq_len..b * seq_len + out_seq.min(seq_len)],
                );
                l2_normalize(&pooled)
            })
            .collect())
    }
}

fn load_session(path: &Path) -> Result<Session> {
    Session::builder()?
        .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)?
        .with_intra_threads(2)?
        .commit_from_file(path)
        .with_context(|| format!("failed to load ONNX model {}", path.display()))
}

fn load_tokenizer(path: &Path) -> Result<Tokenizer> {
    let mut tokenizer = Tokenizer::from_file(path)
        .map_err(|e| anyhow::anyhow!("failed to load tokenizer: {e}"))?;
    tokenizer
        .with_truncation(Some(tokenizers::TruncationParams {
            max_length: MAX_SEQ_LEN,
            ..Default::default()
        }))
        .map_err(|e| anyhow::anyhow!("failed to set truncation: {e}"))?;
    tokenizer.with_padding(Some(tokenizers::PaddingParams {
        strategy: tokenizers::PaddingStrategy::BatchLongest,
        ..Default::default()
    }));
    Ok(tokenizer)
}

/// Average the token rows (`EMBEDDING_DIM` wide) whose mask is set.
fn mean_pool(tokens: &[f32], mask: &[i64]) -> Vec<f32> {
    let mut sum = vec![0.0f32; EMBEDDING_DIM];
    let mut count = 0.0f32;
    for (row, &m) in tokens.chunks_exact(EMBEDDING_DIM).zip(mask) {
        if m > 0 {
            for (acc, v) in sum.iter_mut().zip(row) {
                *acc += v;
            }
            count += 1.0;
        }
    }
    if count > 0.0 {
        sum.iter_mut().for_each(|v| *v /= count);
    }
    sum
}

impl EmbeddingProvider for LearnedEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.encode(&[text])?
            .pop()
            .context("encoder returned no rows")
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        self.encode(texts)
    }

    fn name(&self) -> &'static str {
        "learned"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine_similarity;

    #[test]
    fn mean_pool_skips_masked_rows() {
        let mut tokens = vec![1.0f32; EMBEDDING_DIM];
        tokens.extend(vec![5.0f32; EMBEDDING_DIM]);
        let pooled = mean_pool(&tokens, &[1, 0]);
        assert!(pooled.iter().all(|v| (*v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn missing_model_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = EmbeddingConfig {
            cache_dir: dir.path().to_string_lossy().into_owned(),
            ..EmbeddingConfig::default()
        };
        let err = LearnedEmbeddingProvider::new(&config).err().unwrap();
        assert!(err.to_string().contains("model download"));
    }

    // Needs the model files: `ctxvault model download`, then `cargo test -- --ignored`.
    #[test]
    #[ignore]
    fn learned_vectors_are_normalized_and_meaningful() {
        let provider = LearnedEmbeddingProvider::new(&EmbeddingConfig::default()).unwrap();
        let cat = provider.embed("The cat sat on the mat").unwrap();
        let cat2 = provider.embed("A cat was sitting on a mat").unwrap();
        let qubit = provider.embed("Quantum computing uses qubits").unwrap();

        assert_eq!(cat.len(), EMBEDDING_DIM);
        let norm: f32 = cat.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
        assert!(cosine_similarity(&cat, &cat2).unwrap() > cosine_similarity(&cat, &qubit).unwrap());
    }
}
