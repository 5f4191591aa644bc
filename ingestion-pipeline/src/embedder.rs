//! Batch embedding of chunks through the injected embedding capability.
//! Batches share a semaphore permit with the reranker so model traffic is
//! rate-limited globally; transient provider failures retry with jittered
//! backoff.

use std::sync::Arc;

use chrono::Utc;
use common::{error::RagError, providers::EmbeddingModel, types::Chunk};
use tokio::sync::Semaphore;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    RetryIf,
};
use tracing::debug;

pub struct Embedder {
    model: Arc<dyn EmbeddingModel>,
    batch_size: usize,
    permits: Arc<Semaphore>,
}

impl Embedder {
    pub fn new(model: Arc<dyn EmbeddingModel>, batch_size: usize, permits: Arc<Semaphore>) -> Self {
        Self {
            model,
            batch_size: batch_size.max(1),
            permits,
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    /// Whether a chunk's embedding stamp disagrees with the current model.
    pub fn needs_reembedding(&self, chunk: &Chunk) -> bool {
        chunk.embedding_stale(self.model.model_name(), self.model.model_version())
    }

    /// Embeds chunks in batches, stamping model and version onto each.
    pub async fn embed_chunks(&self, mut chunks: Vec<Chunk>) -> Result<Vec<Chunk>, RagError> {
        for batch in chunks.chunks_mut(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();

            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| RagError::Cancelled)?;

            let strategy = ExponentialBackoff::from_millis(100).map(jitter).take(3);
            let embeddings = RetryIf::spawn(
                strategy,
                || self.model.embed(&texts),
                |err: &RagError| err.is_retryable(),
            )
            .await?;

            if embeddings.len() != batch.len() {
                return Err(RagError::DependencyUnavailable(format!(
                    "embedding batch size mismatch: sent {}, got {}",
                    batch.len(),
                    embeddings.len()
                )));
            }

            let now = Utc::now();
            for (chunk, embedding) in batch.iter_mut().zip(embeddings) {
                chunk.embedding = Some(embedding);
                chunk.embedding_model = Some(self.model.model_name().to_owned());
                chunk.embedding_version = Some(self.model.model_version().to_owned());
                chunk.ts_embedded = Some(now);
            }
        }
        debug!(
            chunks = chunks.len(),
            model = self.model.model_name(),
            "embedded chunk batch"
        );
        Ok(chunks)
    }
}
