pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    error::RagError,
    types::{Chunk, ChunkManifest, GraphEdge, GraphNode, TimeWindow},
};

/// Filters every search must honor. `tenant_id` is mandatory; the rest
/// narrow the candidate set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilters {
    pub tenant_id: String,
    pub acl: Option<Vec<String>>,
    pub time_window: Option<TimeWindow>,
    pub doc_ids: Option<Vec<String>>,
}

impl SearchFilters {
    pub fn for_tenant(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            ..Self::default()
        }
    }

    /// Whether a chunk passes every configured predicate.
    pub fn admits(&self, chunk: &Chunk) -> bool {
        if chunk.tenant_id != self.tenant_id {
            return false;
        }
        if let Some(acl) = &self.acl {
            if !chunk.acl.iter().any(|a| acl.contains(a)) {
                return false;
            }
        }
        if let Some(window) = &self.time_window {
            if chunk.ts_source < window.start || chunk.ts_source >= window.end {
                return false;
            }
        }
        if let Some(doc_ids) = &self.doc_ids {
            if !doc_ids.contains(&chunk.doc_id) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f64,
}

/// Dense-vector search and chunk payload storage. Writes are idempotent by
/// `chunk_id` (upsert semantics), so store-side retries are harmless.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn search(
        &self,
        query: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredChunk>, RagError>;

    async fn upsert(&self, chunks: &[Chunk]) -> Result<(), RagError>;

    async fn delete(&self, chunk_ids: &[String]) -> Result<(), RagError>;

    /// Fetch full payloads for ids that only surfaced in lexical results.
    async fn get_chunks(&self, chunk_ids: &[String]) -> Result<Vec<Chunk>, RagError>;

    async fn healthy(&self) -> bool {
        true
    }
}

/// Lexical (BM25) index over chunk text.
#[async_trait]
pub trait TextIndex: Send + Sync {
    async fn search(
        &self,
        query: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredChunk>, RagError>;

    async fn upsert(&self, chunks: &[Chunk]) -> Result<(), RagError>;

    async fn delete(&self, chunk_ids: &[String]) -> Result<(), RagError>;

    async fn healthy(&self) -> bool {
        true
    }
}

/// Temporal knowledge graph. Edge writes are keyed by `edge_id`.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn upsert_node(&self, node: &GraphNode) -> Result<(), RagError>;

    async fn get_node(&self, id: &str) -> Result<Option<GraphNode>, RagError>;

    /// Existing validity windows for one relation, ascending by
    /// `t_valid_start`.
    async fn edges_between(
        &self,
        source_id: &str,
        edge_type: &str,
        target_id: &str,
    ) -> Result<Vec<GraphEdge>, RagError>;

    async fn create_edge(&self, edge: &GraphEdge) -> Result<(), RagError>;

    async fn update_edge(&self, edge: &GraphEdge) -> Result<(), RagError>;

    async fn delete_edge(&self, edge_id: &str) -> Result<(), RagError>;

    /// Nodes of a tenant whose surface form occurs in the given text.
    async fn search_nodes(&self, tenant_id: &str, text: &str) -> Result<Vec<GraphNode>, RagError>;

    /// Edges reachable from a node within `hops` hops, either direction.
    async fn neighborhood(&self, node_id: &str, hops: usize) -> Result<Vec<GraphEdge>, RagError>;

    async fn healthy(&self) -> bool {
        true
    }
}

#[async_trait]
pub trait ManifestStore: Send + Sync {
    async fn get(&self, doc_id: &str) -> Result<Option<ChunkManifest>, RagError>;

    async fn put(&self, manifest: &ChunkManifest) -> Result<(), RagError>;
}

/// TTL cache used by the reranker.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, RagError>;

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), RagError>;
}
