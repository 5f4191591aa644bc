//! Chunk → embed → index with manifest-driven delta re-indexing.
//! Delete-before-upsert guarantees the indexed set converges to the new
//! chunk set even across partial failures, because both operations are
//! idempotent by `chunk_id`.

use std::{collections::HashSet, sync::Arc};

use chrono::Utc;
use common::{
    config::ChunkingSettings,
    error::RagError,
    storage::{ManifestStore, TextIndex, VectorStore},
    types::{Chunk, ChunkManifest, Document},
};
use tracing::{debug, info, instrument};

use crate::{chunker::Chunker, embedder::Embedder};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkReport {
    pub document_id: String,
    pub chunk_count: usize,
    pub deleted: usize,
    pub reembedded: usize,
}

pub struct TextSink {
    vector_store: Arc<dyn VectorStore>,
    text_index: Arc<dyn TextIndex>,
    manifests: Arc<dyn ManifestStore>,
    embedder: Embedder,
    chunker: Chunker,
    chunk_sizes: Option<Vec<usize>>,
    overlap_ratio: f64,
}

impl TextSink {
    pub fn new(
        vector_store: Arc<dyn VectorStore>,
        text_index: Arc<dyn TextIndex>,
        manifests: Arc<dyn ManifestStore>,
        embedder: Embedder,
        settings: &ChunkingSettings,
    ) -> Self {
        Self {
            vector_store,
            text_index,
            manifests,
            embedder,
            chunker: Chunker::from_settings(settings),
            chunk_sizes: settings.chunk_sizes.clone(),
            overlap_ratio: settings.overlap_ratio,
        }
    }

    fn chunk(&self, document: &Document) -> Vec<Chunk> {
        match &self.chunk_sizes {
            Some(sizes) if !sizes.is_empty() => {
                Chunker::chunk_multi_size(document, sizes, self.overlap_ratio)
            }
            _ => self.chunker.chunk_document(document),
        }
    }

    #[instrument(skip_all, fields(doc_id = %document.id))]
    pub async fn process_document(&self, document: &Document) -> Result<SinkReport, RagError> {
        let existing = self.manifests.get(&document.id).await?;

        if let Some(manifest) = &existing {
            if manifest.checksum == document.checksum {
                return self.refresh_unchanged(document, manifest).await;
            }
        }

        let chunks = self.chunk(document);
        let chunks = self.embedder.embed_chunks(chunks).await?;
        let new_ids: HashSet<&str> = chunks.iter().map(|c| c.chunk_id.as_str()).collect();

        let to_delete: Vec<String> = existing
            .as_ref()
            .map(|manifest| {
                manifest
                    .chunk_ids
                    .iter()
                    .filter(|id| !new_ids.contains(id.as_str()))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        if !to_delete.is_empty() {
            self.vector_store.delete(&to_delete).await?;
            self.text_index.delete(&to_delete).await?;
        }
        self.vector_store.upsert(&chunks).await?;
        self.text_index.upsert(&chunks).await?;

        let manifest = match existing {
            Some(manifest) => manifest.updated(document.checksum.clone(), &chunks),
            None => ChunkManifest::for_document(document, &chunks),
        };
        self.manifests.put(&manifest).await?;

        info!(
            doc_id = %document.id,
            chunks = chunks.len(),
            deleted = to_delete.len(),
            "document indexed"
        );
        Ok(SinkReport {
            document_id: document.id.clone(),
            chunk_count: chunks.len(),
            deleted: to_delete.len(),
            reembedded: 0,
        })
    }

    /// Same checksum: the chunk set is already current. Chunks whose
    /// embedding stamp no longer matches the configured model are
    /// re-embedded in place, without re-chunking.
    async fn refresh_unchanged(
        &self,
        document: &Document,
        manifest: &ChunkManifest,
    ) -> Result<SinkReport, RagError> {
        let chunks = self.vector_store.get_chunks(&manifest.chunk_ids).await?;
        let stale: Vec<Chunk> = chunks
            .into_iter()
            .filter(|c| self.embedder.needs_reembedding(c))
            .collect();
        let reembedded = stale.len();
        if reembedded > 0 {
            debug!(doc_id = %document.id, reembedded, "re-embedding stale chunks");
            let refreshed = self.embedder.embed_chunks(stale).await?;
            self.vector_store.upsert(&refreshed).await?;
        }

        let mut touched = manifest.clone();
        touched.ts_updated = Some(Utc::now());
        self.manifests.put(&touched).await?;

        Ok(SinkReport {
            document_id: document.id.clone(),
            chunk_count: manifest.chunk_ids.len(),
            deleted: 0,
            reembedded,
        })
    }
}
