//! In-memory reference backends for every storage contract. Deterministic
//! and tenant-aware, these are what the tests and the demo binary run
//! against; production deployments inject vendor-backed implementations.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::{
    error::RagError,
    providers::EmbeddingModel,
    storage::{Cache, GraphStore, ManifestStore, ScoredChunk, SearchFilters, TextIndex, VectorStore},
    types::{Chunk, ChunkManifest, GraphEdge, GraphNode},
};

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += f64::from(*x) * f64::from(*y);
        norm_a += f64::from(*x) * f64::from(*x);
        norm_b += f64::from(*y) * f64::from(*y);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Vector store over a map of embedded chunks. Queries are embedded through
/// the injected model, mirroring how vendor stores embed server-side.
pub struct MemoryVectorStore {
    embedder: Arc<dyn EmbeddingModel>,
    chunks: RwLock<HashMap<String, Chunk>>,
}

impl MemoryVectorStore {
    pub fn new(embedder: Arc<dyn EmbeddingModel>) -> Self {
        Self {
            embedder,
            chunks: RwLock::new(HashMap::new()),
        }
    }

    /// Ids currently indexed, for invariant checks in tests.
    pub async fn indexed_ids(&self) -> HashSet<String> {
        self.chunks.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn search(
        &self,
        query: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredChunk>, RagError> {
        let embeddings = self.embedder.embed(&[query.to_owned()]).await?;
        let query_embedding = embeddings
            .into_iter()
            .next()
            .ok_or_else(|| RagError::DependencyUnavailable("empty embedding response".into()))?;

        let chunks = self.chunks.read().await;
        let mut hits: Vec<ScoredChunk> = chunks
            .values()
            .filter(|chunk| filters.admits(chunk))
            .filter_map(|chunk| {
                chunk.embedding.as_ref().map(|embedding| ScoredChunk {
                    chunk: chunk.clone(),
                    score: cosine_similarity(embedding, &query_embedding),
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.chunk_id.cmp(&b.chunk.chunk_id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn upsert(&self, chunks: &[Chunk]) -> Result<(), RagError> {
        let mut store = self.chunks.write().await;
        for chunk in chunks {
            store.insert(chunk.chunk_id.clone(), chunk.clone());
        }
        Ok(())
    }

    async fn delete(&self, chunk_ids: &[String]) -> Result<(), RagError> {
        let mut store = self.chunks.write().await;
        for id in chunk_ids {
            store.remove(id);
        }
        Ok(())
    }

    async fn get_chunks(&self, chunk_ids: &[String]) -> Result<Vec<Chunk>, RagError> {
        let store = self.chunks.read().await;
        Ok(chunk_ids
            .iter()
            .filter_map(|id| store.get(id).cloned())
            .collect())
    }
}

/// Term-frequency lexical index; a stand-in for a BM25 engine with the same
/// contract and deterministic ordering.
#[derive(Default)]
pub struct MemoryTextIndex {
    chunks: RwLock<HashMap<String, Chunk>>,
}

impl MemoryTextIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn indexed_ids(&self) -> HashSet<String> {
        self.chunks.read().await.keys().cloned().collect()
    }
}

fn lexical_score(query: &str, text: &str) -> f64 {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|t| t.to_lowercase())
        .collect();
    if terms.is_empty() {
        return 0.0;
    }
    let tokens: Vec<String> = text.split_whitespace().map(|t| t.to_lowercase()).collect();
    let mut score = 0.0f64;
    for term in &terms {
        let tf = tokens.iter().filter(|t| *t == term).count();
        score += tf as f64;
    }
    score
}

#[async_trait]
impl TextIndex for MemoryTextIndex {
    async fn search(
        &self,
        query: &str,
        top_k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<ScoredChunk>, RagError> {
        let chunks = self.chunks.read().await;
        let mut hits: Vec<ScoredChunk> = chunks
            .values()
            .filter(|chunk| filters.admits(chunk))
            .filter_map(|chunk| {
                let score = lexical_score(query, &chunk.text);
                (score > 0.0).then(|| ScoredChunk {
                    chunk: chunk.clone(),
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.chunk_id.cmp(&b.chunk.chunk_id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn upsert(&self, chunks: &[Chunk]) -> Result<(), RagError> {
        let mut store = self.chunks.write().await;
        for chunk in chunks {
            store.insert(chunk.chunk_id.clone(), chunk.clone());
        }
        Ok(())
    }

    async fn delete(&self, chunk_ids: &[String]) -> Result<(), RagError> {
        let mut store = self.chunks.write().await;
        for id in chunk_ids {
            store.remove(id);
        }
        Ok(())
    }
}

/// Node/edge maps with BFS neighborhood expansion.
#[derive(Default)]
pub struct MemoryGraphStore {
    nodes: RwLock<HashMap<String, GraphNode>>,
    edges: RwLock<HashMap<String, GraphEdge>>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all_edges(&self) -> Vec<GraphEdge> {
        self.edges.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn upsert_node(&self, node: &GraphNode) -> Result<(), RagError> {
        self.nodes
            .write()
            .await
            .insert(node.id.clone(), node.clone());
        Ok(())
    }

    async fn get_node(&self, id: &str) -> Result<Option<GraphNode>, RagError> {
        Ok(self.nodes.read().await.get(id).cloned())
    }

    async fn edges_between(
        &self,
        source_id: &str,
        edge_type: &str,
        target_id: &str,
    ) -> Result<Vec<GraphEdge>, RagError> {
        let edges = self.edges.read().await;
        let mut matched: Vec<GraphEdge> = edges
            .values()
            .filter(|e| {
                e.source_id == source_id && e.edge_type == edge_type && e.target_id == target_id
            })
            .cloned()
            .collect();
        matched.sort_by_key(|e| e.t_valid_start);
        Ok(matched)
    }

    async fn create_edge(&self, edge: &GraphEdge) -> Result<(), RagError> {
        self.edges
            .write()
            .await
            .insert(edge.id.clone(), edge.clone());
        Ok(())
    }

    async fn update_edge(&self, edge: &GraphEdge) -> Result<(), RagError> {
        self.edges
            .write()
            .await
            .insert(edge.id.clone(), edge.clone());
        Ok(())
    }

    async fn delete_edge(&self, edge_id: &str) -> Result<(), RagError> {
        self.edges.write().await.remove(edge_id);
        Ok(())
    }

    async fn search_nodes(&self, tenant_id: &str, text: &str) -> Result<Vec<GraphNode>, RagError> {
        let haystack = text.to_lowercase();
        let nodes = self.nodes.read().await;
        let mut matched: Vec<GraphNode> = nodes
            .values()
            .filter(|n| n.tenant_id == tenant_id && haystack.contains(&n.surface().to_lowercase()))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matched)
    }

    async fn neighborhood(&self, node_id: &str, hops: usize) -> Result<Vec<GraphEdge>, RagError> {
        let edges = self.edges.read().await;
        let mut visited_nodes: HashSet<String> = HashSet::new();
        let mut collected: HashMap<String, GraphEdge> = HashMap::new();
        let mut frontier: VecDeque<(String, usize)> = VecDeque::new();
        visited_nodes.insert(node_id.to_owned());
        frontier.push_back((node_id.to_owned(), 0));

        while let Some((current, depth)) = frontier.pop_front() {
            if depth >= hops {
                continue;
            }
            for edge in edges.values() {
                let next = if edge.source_id == current {
                    Some(edge.target_id.clone())
                } else if edge.target_id == current {
                    Some(edge.source_id.clone())
                } else {
                    None
                };
                if let Some(next) = next {
                    collected.insert(edge.id.clone(), edge.clone());
                    if visited_nodes.insert(next.clone()) {
                        frontier.push_back((next, depth + 1));
                    }
                }
            }
        }

        let mut result: Vec<GraphEdge> = collected.into_values().collect();
        result.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(result)
    }
}

#[derive(Default)]
pub struct MemoryManifestStore {
    manifests: RwLock<HashMap<String, ChunkManifest>>,
}

impl MemoryManifestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ManifestStore for MemoryManifestStore {
    async fn get(&self, doc_id: &str) -> Result<Option<ChunkManifest>, RagError> {
        Ok(self.manifests.read().await.get(doc_id).cloned())
    }

    async fn put(&self, manifest: &ChunkManifest) -> Result<(), RagError> {
        self.manifests
            .write()
            .await
            .insert(manifest.doc_id.clone(), manifest.clone());
        Ok(())
    }
}

/// TTL cache; entries expire lazily on read.
#[derive(Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, (Value, Instant)>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Value>, RagError> {
        let expired = {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some((value, deadline)) => {
                    if Instant::now() < *deadline {
                        return Ok(Some(value.clone()));
                    }
                    true
                }
                None => false,
            }
        };
        if expired {
            self.entries.write().await.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<(), RagError> {
        self.entries
            .write()
            .await
            .insert(key.to_owned(), (value, Instant::now() + ttl));
        Ok(())
    }
}
