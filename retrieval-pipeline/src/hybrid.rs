//! Hybrid retrieval: dense and lexical searches fan out concurrently, fuse
//! via RRF, and full payloads are hydrated from the in-memory hits (with a
//! vector-store fallback for ids that only surfaced lexically). The
//! graph-augmented variant constrains candidates to documents reachable
//! from query entities and appends edge pseudo-chunks.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use common::{
    config::RetrievalSettings,
    error::RagError,
    storage::{GraphStore, SearchFilters, TextIndex, VectorStore},
    types::{Chunk, GraphEdge},
};
use tracing::{debug, instrument};

use crate::{
    fusion::{reciprocal_rank_fusion, RankedList},
    ContextItem, RankedItem,
};

pub struct HybridRetriever {
    vector_store: Arc<dyn VectorStore>,
    text_index: Arc<dyn TextIndex>,
    graph: Option<Arc<dyn GraphStore>>,
    settings: RetrievalSettings,
}

impl HybridRetriever {
    pub fn new(
        vector_store: Arc<dyn VectorStore>,
        text_index: Arc<dyn TextIndex>,
        graph: Option<Arc<dyn GraphStore>>,
        settings: RetrievalSettings,
    ) -> Self {
        Self {
            vector_store,
            text_index,
            graph,
            settings,
        }
    }

    #[instrument(skip_all, fields(tenant_id = %filters.tenant_id, top_k = ?top_k))]
    pub async fn retrieve(
        &self,
        query: &str,
        filters: &SearchFilters,
        top_k: Option<usize>,
    ) -> Result<Vec<RankedItem>, RagError> {
        let top_k = top_k.unwrap_or(self.settings.top_k);

        let (vector_hits, text_hits) = tokio::try_join!(
            self.vector_store.search(query, top_k, filters),
            self.text_index.search(query, top_k, filters)
        )?;
        debug!(
            vector_hits = vector_hits.len(),
            text_hits = text_hits.len(),
            "search fan-out complete"
        );

        let fused = reciprocal_rank_fusion(
            &[
                RankedList {
                    ids: vector_hits.iter().map(|h| h.chunk.chunk_id.clone()).collect(),
                    weight: self.settings.vector_weight,
                },
                RankedList {
                    ids: text_hits.iter().map(|h| h.chunk.chunk_id.clone()).collect(),
                    weight: self.settings.bm25_weight,
                },
            ],
            self.settings.rrf_k,
        );

        // Hydrate payloads: vector hits first, then lexical, then a store
        // fetch for anything still missing.
        let mut payloads: HashMap<String, Chunk> = HashMap::new();
        for hit in vector_hits {
            payloads.entry(hit.chunk.chunk_id.clone()).or_insert(hit.chunk);
        }
        for hit in text_hits {
            payloads.entry(hit.chunk.chunk_id.clone()).or_insert(hit.chunk);
        }
        let missing: Vec<String> = fused
            .iter()
            .filter(|hit| !payloads.contains_key(&hit.id))
            .map(|hit| hit.id.clone())
            .collect();
        if !missing.is_empty() {
            for chunk in self.vector_store.get_chunks(&missing).await? {
                payloads.insert(chunk.chunk_id.clone(), chunk);
            }
        }

        Ok(fused
            .into_iter()
            .filter_map(|hit| {
                payloads.remove(&hit.id).map(|chunk| RankedItem {
                    item: ContextItem::Chunk { chunk },
                    score: hit.score,
                })
            })
            .take(top_k)
            .collect())
    }

    /// Links query entities, expands their 1–2 hop neighborhood, and
    /// intersects retrieval with the reachable documents. Falls back to
    /// plain retrieval when no graph is wired or no entity matches.
    #[instrument(skip_all, fields(tenant_id = %filters.tenant_id))]
    pub async fn retrieve_with_graph(
        &self,
        query: &str,
        filters: &SearchFilters,
        top_k: Option<usize>,
    ) -> Result<Vec<RankedItem>, RagError> {
        let Some(graph) = &self.graph else {
            return self.retrieve(query, filters, top_k).await;
        };

        let nodes = graph.search_nodes(&filters.tenant_id, query).await?;
        if nodes.is_empty() {
            return self.retrieve(query, filters, top_k).await;
        }

        let mut doc_ids: HashSet<String> = HashSet::new();
        let mut edges: HashMap<String, GraphEdge> = HashMap::new();
        for node in &nodes {
            doc_ids.insert(node.provenance.document_id.clone());
            for edge in graph.neighborhood(&node.id, 2).await? {
                doc_ids.insert(edge.provenance.document_id.clone());
                edges.insert(edge.id.clone(), edge);
            }
        }
        debug!(
            linked_entities = nodes.len(),
            reachable_docs = doc_ids.len(),
            edges = edges.len(),
            "graph expansion complete"
        );

        let mut constrained = filters.clone();
        let mut ids: Vec<String> = doc_ids.into_iter().collect();
        ids.sort();
        constrained.doc_ids = Some(ids);

        let mut results = self.retrieve(query, &constrained, top_k).await?;

        let mut pseudo: Vec<GraphEdge> = edges.into_values().collect();
        pseudo.sort_by(|a, b| a.id.cmp(&b.id));
        results.extend(pseudo.into_iter().map(|edge| RankedItem {
            item: ContextItem::Edge { edge },
            score: 0.0,
        }));
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use common::{
        providers::hashing::HashEmbedder,
        storage::memory::{MemoryGraphStore, MemoryTextIndex, MemoryVectorStore},
        types::{GraphNode, Provenance},
    };

    struct Fixture {
        vector_store: Arc<MemoryVectorStore>,
        text_index: Arc<MemoryTextIndex>,
        graph: Arc<MemoryGraphStore>,
        embedder: Arc<HashEmbedder>,
    }

    impl Fixture {
        fn new() -> Self {
            let embedder = Arc::new(HashEmbedder::new(64));
            Self {
                vector_store: Arc::new(MemoryVectorStore::new(embedder.clone())),
                text_index: Arc::new(MemoryTextIndex::new()),
                graph: Arc::new(MemoryGraphStore::new()),
                embedder,
            }
        }

        fn retriever(&self) -> HybridRetriever {
            HybridRetriever::new(
                self.vector_store.clone(),
                self.text_index.clone(),
                Some(self.graph.clone()),
                RetrievalSettings::default(),
            )
        }

        async fn index_chunk(&self, id: &str, doc_id: &str, text: &str, vector_only: bool) {
            let embedding = self
                .embedder
                .embed(&[text.to_owned()])
                .await
                .unwrap()
                .remove(0);
            let chunk = Chunk {
                chunk_id: id.to_owned(),
                doc_id: doc_id.to_owned(),
                text: text.to_owned(),
                tokens: text.split_whitespace().count(),
                tenant_id: "acme".into(),
                source_tool: "crm".into(),
                source_id: "doc".into(),
                acl: vec!["tenant:acme".into()],
                ts_source: Utc::now(),
                ts_chunked: Utc::now(),
                chunker_version: "1.0".into(),
                embedding: Some(embedding),
                embedding_model: Some("hash-embedder".into()),
                embedding_version: Some("1.0".into()),
                ts_embedded: Some(Utc::now()),
            };
            self.vector_store.upsert(&[chunk.clone()]).await.unwrap();
            if !vector_only {
                self.text_index.upsert(&[chunk]).await.unwrap();
            }
        }
    }

    use common::providers::EmbeddingModel;

    #[tokio::test]
    async fn fuses_vector_and_lexical_hits() {
        let fx = Fixture::new();
        fx.index_chunk("c1", "acme:crm:d1", "tokio runtime scheduler", false)
            .await;
        fx.index_chunk("c2", "acme:crm:d2", "tokio tasks and channels", false)
            .await;
        fx.index_chunk("c3", "acme:crm:d3", "apple pie recipe", false).await;

        let results = fx
            .retriever()
            .retrieve("tokio runtime", &SearchFilters::for_tenant("acme"), None)
            .await
            .unwrap();

        assert!(!results.is_empty());
        assert_eq!(results[0].item.id(), "c1");
        assert!(results[0].score >= results[results.len() - 1].score);
    }

    #[tokio::test]
    async fn empty_stores_return_empty_results() {
        let fx = Fixture::new();
        let results = fx
            .retriever()
            .retrieve("anything", &SearchFilters::for_tenant("acme"), None)
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn duplicate_hits_collapse_to_one_result() {
        let fx = Fixture::new();
        fx.index_chunk("c1", "acme:crm:d1", "tokio runtime scheduler", false)
            .await;

        let results = fx
            .retriever()
            .retrieve("tokio runtime", &SearchFilters::for_tenant("acme"), None)
            .await
            .unwrap();

        // Present in both stores, fused into a single entry whose score
        // sums both contributions.
        assert_eq!(results.len(), 1);
        assert!(results[0].score > 1.0 / 60.0);
    }

    #[tokio::test]
    async fn top_k_truncates_results() {
        let fx = Fixture::new();
        for i in 0..10 {
            fx.index_chunk(
                &format!("c{i}"),
                &format!("acme:crm:d{i}"),
                "tokio tokio tokio",
                false,
            )
            .await;
        }
        let results = fx
            .retriever()
            .retrieve("tokio", &SearchFilters::for_tenant("acme"), Some(3))
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
    }

    #[tokio::test]
    async fn graph_variant_constrains_to_reachable_docs_and_appends_edges() {
        let fx = Fixture::new();
        fx.index_chunk("c1", "acme:crm:d1", "Ada ships the tokio migration", false)
            .await;
        fx.index_chunk("c2", "acme:crm:d2", "unrelated tokio trivia", false)
            .await;

        let provenance = Provenance {
            document_id: "acme:crm:d1".into(),
            source_tool: "crm".into(),
            ts_extracted: Utc::now(),
        };
        fx.graph
            .upsert_node(&GraphNode {
                id: GraphNode::compose_id("acme", "person", "Ada"),
                node_type: "person".into(),
                summary: "Ada".into(),
                tenant_id: "acme".into(),
                provenance: provenance.clone(),
            })
            .await
            .unwrap();
        let start = Utc::now();
        fx.graph
            .create_edge(&GraphEdge {
                id: GraphEdge::compose_id(
                    "acme:person:Ada",
                    "works_on",
                    "acme:project:Migration",
                    start,
                ),
                source_id: "acme:person:Ada".into(),
                target_id: "acme:project:Migration".into(),
                edge_type: "works_on".into(),
                t_valid_start: start,
                t_valid_end: start + chrono::Duration::days(365),
                confidence: 0.9,
                tenant_id: "acme".into(),
                provenance,
            })
            .await
            .unwrap();

        let results = fx
            .retriever()
            .retrieve_with_graph(
                "what is ada working on",
                &SearchFilters::for_tenant("acme"),
                None,
            )
            .await
            .unwrap();

        // Only d1 is reachable from the linked entity; d2 is filtered out.
        assert!(results
            .iter()
            .all(|r| match &r.item {
                ContextItem::Chunk { chunk } => chunk.doc_id == "acme:crm:d1",
                ContextItem::Edge { .. } => true,
            }));
        assert!(results
            .iter()
            .any(|r| matches!(&r.item, ContextItem::Edge { edge } if edge.edge_type == "works_on")));
    }

    #[tokio::test]
    async fn graph_variant_without_entity_match_falls_back() {
        let fx = Fixture::new();
        fx.index_chunk("c1", "acme:crm:d1", "plain tokio facts", false).await;

        let results = fx
            .retriever()
            .retrieve_with_graph("tokio", &SearchFilters::for_tenant("acme"), None)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0].item, ContextItem::Chunk { .. }));
    }
}
