use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::utils::hash::md5_hex;

/// A slice of a document's content, keyed deterministically so identical
/// re-chunks are no-ops in the indexes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub text: String,
    pub tokens: usize,
    pub tenant_id: String,
    pub source_tool: String,
    pub source_id: String,
    #[serde(default)]
    pub acl: Vec<String>,
    pub ts_source: DateTime<Utc>,
    pub ts_chunked: DateTime<Utc>,
    pub chunker_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_embedded: Option<DateTime<Utc>>,
}

impl Chunk {
    /// Deterministic id from `(doc_id, text)`.
    pub fn deterministic_id(doc_id: &str, text: &str) -> String {
        md5_hex(format!("{doc_id}:{text}").as_bytes())
    }

    /// Size-scoped variant used by multi-size chunking, so chunks produced
    /// at different target sizes can never collide.
    pub fn deterministic_id_scoped(doc_id: &str, text: &str, chunk_size: usize) -> String {
        md5_hex(format!("{doc_id}:{chunk_size}:{text}").as_bytes())
    }

    /// True when the stamp on this chunk does not match the currently
    /// configured embedding model, i.e. it needs re-embedding.
    pub fn embedding_stale(&self, model_name: &str, model_version: &str) -> bool {
        self.embedding_model.as_deref() != Some(model_name)
            || self.embedding_version.as_deref() != Some(model_version)
    }
}
