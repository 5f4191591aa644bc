//! Cross-encoder reranking with feature adjustments (recency, entity
//! overlap) and a TTL result cache. The model name is part of the cache
//! key, so a model change invalidates implicitly.

use std::{collections::HashSet, sync::Arc, time::Duration};

use chrono::Utc;
use common::{
    config::RerankerSettings,
    error::RagError,
    providers::CrossEncoderModel,
    storage::{Cache, GraphStore},
    utils::hash::content_hash,
};
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use crate::{ContextItem, RankedItem};

const MAX_AGE_DAYS: f64 = 365.0;
const DEFAULT_RECENCY: f64 = 0.5;

#[derive(Debug, Clone, PartialEq)]
pub struct RerankOutput {
    pub items: Vec<RankedItem>,
    /// How many of the requested `top_k` fell short of the quality
    /// threshold. Reported, never padded.
    pub shortfall: usize,
}

pub struct Reranker {
    model: Arc<dyn CrossEncoderModel>,
    cache: Arc<dyn Cache>,
    graph: Option<Arc<dyn GraphStore>>,
    settings: RerankerSettings,
    permits: Arc<Semaphore>,
}

impl Reranker {
    pub fn new(
        model: Arc<dyn CrossEncoderModel>,
        cache: Arc<dyn Cache>,
        graph: Option<Arc<dyn GraphStore>>,
        settings: RerankerSettings,
        permits: Arc<Semaphore>,
    ) -> Self {
        Self {
            model,
            cache,
            graph,
            settings,
            permits,
        }
    }

    fn cache_key(&self, query: &str, candidates: &[RankedItem]) -> String {
        let mut ids: Vec<&str> = candidates.iter().map(|c| c.item.id()).collect();
        ids.sort_unstable();
        content_hash(&json!({
            "query": query,
            "candidate_ids": ids,
            "model": self.model.model_name(),
        }))
    }

    fn recency(item: &ContextItem) -> f64 {
        match item {
            ContextItem::Chunk { chunk } => {
                let age_days =
                    (Utc::now() - chunk.ts_source).num_seconds() as f64 / (24.0 * 3600.0);
                (1.0 - age_days / MAX_AGE_DAYS).clamp(0.0, 1.0)
            }
            // Edges carry validity windows, not source timestamps.
            ContextItem::Edge { .. } => DEFAULT_RECENCY,
        }
    }

    fn entity_overlap(item: &ContextItem, query_entities: &HashSet<String>) -> f64 {
        if query_entities.is_empty() {
            return 0.0;
        }
        let text = item.display_text().to_lowercase();
        let matched = query_entities
            .iter()
            .filter(|surface| text.contains(surface.as_str()))
            .count();
        matched as f64 / query_entities.len() as f64
    }

    async fn query_entities(&self, tenant_id: &str, query: &str) -> HashSet<String> {
        let Some(graph) = &self.graph else {
            return HashSet::new();
        };
        match graph.search_nodes(tenant_id, query).await {
            Ok(nodes) => nodes
                .iter()
                .map(|n| n.surface().to_lowercase())
                .collect(),
            Err(err) => {
                warn!(error = %err, "entity lookup failed; overlap feature disabled");
                HashSet::new()
            }
        }
    }

    #[instrument(skip_all, fields(candidates = candidates.len(), tenant_id = %tenant_id))]
    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<RankedItem>,
        tenant_id: &str,
        top_k: Option<usize>,
    ) -> Result<RerankOutput, RagError> {
        let top_k = top_k.unwrap_or(self.settings.top_k);
        if candidates.is_empty() {
            return Ok(RerankOutput {
                items: Vec::new(),
                shortfall: top_k,
            });
        }

        let cache_key = self.cache_key(query, &candidates);
        if let Some(hit) = self.cache.get(&cache_key).await? {
            if let Ok(items) = serde_json::from_value::<Vec<RankedItem>>(hit) {
                debug!("rerank cache hit");
                let shortfall = self.shortfall(&items, top_k);
                return Ok(RerankOutput { items, shortfall });
            }
        }

        let query_entities = self.query_entities(tenant_id, query).await;

        let mut scored: Vec<RankedItem> = Vec::with_capacity(candidates.len());
        for batch in candidates.chunks(self.settings.batch_size.max(1)) {
            let documents: Vec<String> = batch.iter().map(|c| c.item.display_text()).collect();

            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| RagError::Cancelled)?;
            let base_scores = self.model.score_pairs(query, &documents).await?;
            if base_scores.len() != batch.len() {
                return Err(RagError::DependencyUnavailable(format!(
                    "cross-encoder returned {} scores for {} pairs",
                    base_scores.len(),
                    batch.len()
                )));
            }

            for (candidate, base) in batch.iter().zip(base_scores) {
                let recency = Self::recency(&candidate.item);
                let overlap = Self::entity_overlap(&candidate.item, &query_entities);
                let score = base
                    + self.settings.recency_weight * recency
                    + self.settings.entity_weight * overlap;
                scored.push(RankedItem {
                    item: candidate.item.clone(),
                    score,
                });
            }
        }

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.item.id().cmp(b.item.id()))
        });
        scored.truncate(top_k);

        self.cache
            .set(
                &cache_key,
                serde_json::to_value(&scored)?,
                Duration::from_secs(self.settings.cache_ttl),
            )
            .await?;

        let shortfall = self.shortfall(&scored, top_k);
        if shortfall > 0 {
            warn!(
                shortfall,
                top_k,
                threshold = self.settings.quality_threshold,
                "rerank returned fewer high-quality results than requested"
            );
        }
        Ok(RerankOutput {
            items: scored,
            shortfall,
        })
    }

    fn shortfall(&self, items: &[RankedItem], top_k: usize) -> usize {
        let above = items
            .iter()
            .filter(|i| i.score > self.settings.quality_threshold)
            .count();
        top_k.saturating_sub(above)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::chunk_item;
    use async_trait::async_trait;
    use common::storage::memory::MemoryCache;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scores each document by its token count; counts invocations so cache
    /// hits are observable.
    struct LengthScorer {
        name: String,
        calls: AtomicUsize,
    }

    impl LengthScorer {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_owned(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CrossEncoderModel for LengthScorer {
        fn model_name(&self) -> &str {
            &self.name
        }

        async fn score_pairs(
            &self,
            _query: &str,
            documents: &[String],
        ) -> Result<Vec<f64>, RagError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(documents
                .iter()
                .map(|d| d.split_whitespace().count() as f64)
                .collect())
        }
    }

    fn reranker_with(model: Arc<LengthScorer>, settings: RerankerSettings) -> Reranker {
        Reranker::new(
            model,
            Arc::new(MemoryCache::new()),
            None,
            settings,
            Arc::new(Semaphore::new(2)),
        )
    }

    fn candidates() -> Vec<RankedItem> {
        vec![
            RankedItem {
                item: chunk_item("c1", "short", Utc::now()),
                score: 0.0,
            },
            RankedItem {
                item: chunk_item("c2", "a much longer candidate text body", Utc::now()),
                score: 0.0,
            },
            RankedItem {
                item: chunk_item("c3", "medium length text", Utc::now()),
                score: 0.0,
            },
        ]
    }

    #[tokio::test]
    async fn orders_by_combined_score() {
        let model = Arc::new(LengthScorer::new("len"));
        let reranker = reranker_with(model, RerankerSettings::default());

        let out = reranker
            .rerank("query", candidates(), "acme", Some(3))
            .await
            .unwrap();
        let ids: Vec<&str> = out.items.iter().map(|i| i.item.id()).collect();
        assert_eq!(ids, vec!["c2", "c3", "c1"]);
    }

    #[tokio::test]
    async fn recency_feature_boosts_fresh_documents() {
        let model = Arc::new(LengthScorer::new("len"));
        let settings = RerankerSettings {
            recency_weight: 10.0,
            ..RerankerSettings::default()
        };
        let reranker = reranker_with(model, settings);

        let old = Utc::now() - chrono::Duration::days(800);
        let items = vec![
            RankedItem {
                item: chunk_item("old", "same words here", old),
                score: 0.0,
            },
            RankedItem {
                item: chunk_item("new", "same words here", Utc::now()),
                score: 0.0,
            },
        ];
        let out = reranker.rerank("query", items, "acme", Some(2)).await.unwrap();
        assert_eq!(out.items[0].item.id(), "new");
    }

    #[tokio::test]
    async fn cache_hit_skips_model_and_model_change_invalidates() {
        let model = Arc::new(LengthScorer::new("model-a"));
        let cache = Arc::new(MemoryCache::new());
        let reranker = Reranker::new(
            model.clone(),
            cache.clone(),
            None,
            RerankerSettings::default(),
            Arc::new(Semaphore::new(2)),
        );

        reranker
            .rerank("query", candidates(), "acme", Some(3))
            .await
            .unwrap();
        reranker
            .rerank("query", candidates(), "acme", Some(3))
            .await
            .unwrap();
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);

        // Same cache, different model name: fresh scoring.
        let other = Arc::new(LengthScorer::new("model-b"));
        let reranker = Reranker::new(
            other.clone(),
            cache,
            None,
            RerankerSettings::default(),
            Arc::new(Semaphore::new(2)),
        );
        reranker
            .rerank("query", candidates(), "acme", Some(3))
            .await
            .unwrap();
        assert_eq!(other.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shortfall_reports_low_quality_results_without_padding() {
        let model = Arc::new(LengthScorer::new("len"));
        let settings = RerankerSettings {
            quality_threshold: 100.0,
            ..RerankerSettings::default()
        };
        let reranker = reranker_with(model, settings);

        let out = reranker
            .rerank("query", candidates(), "acme", Some(5))
            .await
            .unwrap();
        assert_eq!(out.items.len(), 3);
        assert_eq!(out.shortfall, 5);
    }

    #[tokio::test]
    async fn empty_candidates_short_circuit() {
        let model = Arc::new(LengthScorer::new("len"));
        let reranker = reranker_with(model.clone(), RerankerSettings::default());
        let out = reranker.rerank("query", Vec::new(), "acme", None).await.unwrap();
        assert!(out.items.is_empty());
        assert_eq!(model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn batches_split_by_batch_size() {
        let model = Arc::new(LengthScorer::new("len"));
        let settings = RerankerSettings {
            batch_size: 2,
            ..RerankerSettings::default()
        };
        let reranker = reranker_with(model.clone(), settings);
        reranker
            .rerank("query", candidates(), "acme", Some(3))
            .await
            .unwrap();
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    }
}
