//! Deterministic token-hash embedder. No model weights, no network: each
//! token is hashed into a bucket and counts are L2-normalized. Useful for
//! offline runs and as the embedding capability behind the in-memory vector
//! store in tests.

use async_trait::async_trait;

use super::EmbeddingModel;
use crate::{error::RagError, utils::hash::md5_hex};

pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in text.split_whitespace() {
            let digest = md5_hex(token.to_lowercase().as_bytes());
            let bucket = usize::from_str_radix(digest.get(..8).unwrap_or("0"), 16)
                .unwrap_or(0)
                % self.dimensions;
            if let Some(slot) = vector.get_mut(bucket) {
                *slot += 1.0;
            }
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingModel for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-embedder"
    }

    fn model_version(&self) -> &str {
        "1.0"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}
