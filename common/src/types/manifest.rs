use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Chunk, Document};

/// Per-document record of current chunk membership. Drives delta
/// re-indexing: the indexed set for a document always converges to
/// `chunk_ids` after a successful sink run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkManifest {
    pub doc_id: String,
    pub tenant_id: String,
    pub source_tool: String,
    pub source_id: String,
    pub checksum: String,
    pub chunk_ids: Vec<String>,
    pub ts_created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts_updated: Option<DateTime<Utc>>,
}

impl ChunkManifest {
    pub fn for_document(document: &Document, chunks: &[Chunk]) -> Self {
        Self {
            doc_id: document.id.clone(),
            tenant_id: document.tenant_id.clone(),
            source_tool: document.source_tool.clone(),
            source_id: document.source_id.clone(),
            checksum: document.checksum.clone(),
            chunk_ids: chunks.iter().map(|c| c.chunk_id.clone()).collect(),
            ts_created: Utc::now(),
            ts_updated: None,
        }
    }

    /// Replaces the chunk set, keeping the original creation timestamp.
    pub fn updated(mut self, checksum: String, chunks: &[Chunk]) -> Self {
        self.checksum = checksum;
        self.chunk_ids = chunks.iter().map(|c| c.chunk_id.clone()).collect();
        self.ts_updated = Some(Utc::now());
        self
    }
}
