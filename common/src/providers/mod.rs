//! Narrow capability contracts over model providers. Concrete backends are
//! injected behind these traits; nothing downstream knows which vendor is
//! wired in.

pub mod hashing;
pub mod openai;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::RagError;

/// Opaque text-generation capability.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, RagError>;

    /// Lazy token stream; the stream ends when the provider completes.
    async fn generate_stream(
        &self,
        prompt: &str,
    ) -> Result<BoxStream<'static, Result<String, RagError>>, RagError>;
}

/// Opaque embedding capability. Model name and version are stamped onto
/// chunks so stale embeddings can be detected later.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    fn model_name(&self) -> &str;

    fn model_version(&self) -> &str;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, RagError>;
}

/// Cross-encoder capability scoring `(query, document)` pairs jointly.
#[async_trait]
pub trait CrossEncoderModel: Send + Sync {
    fn model_name(&self) -> &str;

    async fn score_pairs(&self, query: &str, documents: &[String])
        -> Result<Vec<f64>, RagError>;
}
