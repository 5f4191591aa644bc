//! Temporal knowledge-graph sink. Extracted entities dedupe by
//! `tenant:type:surface`; relations become edges with a validity window and
//! go through conflict resolution so that for any `(source, type, target)`
//! and instant, at most one edge is valid. Resolution is serialized per
//! relation key.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::{
    error::RagError,
    storage::GraphStore,
    types::{Document, GraphEdge, GraphNode, Provenance},
};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

const DEFAULT_VALIDITY_DAYS: i64 = 3650;

#[derive(Debug, Clone, PartialEq)]
pub struct EntityMention {
    pub entity_type: String,
    pub surface: String,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationMention {
    pub relation_type: String,
    pub source: EntityMention,
    pub target: EntityMention,
    pub confidence: f32,
}

#[async_trait]
pub trait EntityExtractor: Send + Sync {
    async fn extract(&self, document: &Document) -> Result<Vec<EntityMention>, RagError>;
}

#[async_trait]
pub trait RelationExtractor: Send + Sync {
    async fn extract(
        &self,
        document: &Document,
        mentions: &[EntityMention],
    ) -> Result<Vec<RelationMention>, RagError>;
}

/// What conflict resolution did to restore the non-overlap invariant.
/// Emitted as events, never as errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictResolution {
    TruncatedExisting {
        edge_id: String,
        new_end: DateTime<Utc>,
    },
    DeletedExisting {
        edge_id: String,
    },
    ClippedNew {
        edge_id: String,
    },
    DroppedNew {
        relation: String,
    },
}

#[derive(Debug, Clone)]
pub struct GraphReport {
    pub document_id: String,
    pub nodes_upserted: usize,
    pub edges_created: usize,
    pub conflicts: Vec<ConflictResolution>,
}

enum EdgeOp {
    Truncate {
        edge: GraphEdge,
        new_end: DateTime<Utc>,
    },
    Delete {
        edge_id: String,
    },
    Insert(GraphEdge),
}

/// Resolves a new edge against the existing windows of its relation,
/// processed in ascending `t_valid_start`. Pure, so the rules are testable
/// without a store.
fn resolve_conflicts(
    new_edge: GraphEdge,
    existing: &[GraphEdge],
) -> (Vec<EdgeOp>, Vec<ConflictResolution>) {
    let mut ops = Vec::new();
    let mut events = Vec::new();
    let mut candidate = Some(new_edge);

    for edge in existing {
        let Some(mut new) = candidate.take() else {
            break;
        };
        if !edge.overlaps(new.t_valid_start, new.t_valid_end) {
            candidate = Some(new);
            continue;
        }

        let new_wins = if new.confidence > edge.confidence {
            true
        } else if new.confidence < edge.confidence {
            false
        } else {
            // Equal confidence: the later extraction wins.
            new.provenance.ts_extracted > edge.provenance.ts_extracted
        };

        if new_wins {
            if edge.t_valid_start >= new.t_valid_start {
                // Truncation would leave an empty window.
                ops.push(EdgeOp::Delete {
                    edge_id: edge.id.clone(),
                });
                events.push(ConflictResolution::DeletedExisting {
                    edge_id: edge.id.clone(),
                });
            } else {
                ops.push(EdgeOp::Truncate {
                    edge: edge.clone(),
                    new_end: new.t_valid_start,
                });
                events.push(ConflictResolution::TruncatedExisting {
                    edge_id: edge.id.clone(),
                    new_end: new.t_valid_start,
                });
            }
            candidate = Some(new);
            continue;
        }

        // The existing edge wins; clip or drop the new one.
        if new.t_valid_start < edge.t_valid_start {
            new.t_valid_end = edge.t_valid_start;
            events.push(ConflictResolution::ClippedNew {
                edge_id: new.id.clone(),
            });
            candidate = Some(new);
        } else if new.t_valid_end > edge.t_valid_end {
            new.t_valid_start = edge.t_valid_end;
            new.id = GraphEdge::compose_id(
                &new.source_id,
                &new.edge_type,
                &new.target_id,
                new.t_valid_start,
            );
            events.push(ConflictResolution::ClippedNew {
                edge_id: new.id.clone(),
            });
            candidate = Some(new);
        } else {
            events.push(ConflictResolution::DroppedNew {
                relation: new.relation_key(),
            });
        }
    }

    if let Some(new) = candidate {
        ops.push(EdgeOp::Insert(new));
    }
    (ops, events)
}

pub struct GraphSink {
    graph: Arc<dyn GraphStore>,
    entity_extractors: Vec<Arc<dyn EntityExtractor>>,
    relation_extractors: Vec<Arc<dyn RelationExtractor>>,
    relation_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl GraphSink {
    pub fn new(
        graph: Arc<dyn GraphStore>,
        entity_extractors: Vec<Arc<dyn EntityExtractor>>,
        relation_extractors: Vec<Arc<dyn RelationExtractor>>,
    ) -> Self {
        Self {
            graph,
            entity_extractors,
            relation_extractors,
            relation_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn relation_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.relation_locks.lock().await;
        locks
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    #[instrument(skip_all, fields(doc_id = %document.id))]
    pub async fn process_document(&self, document: &Document) -> Result<GraphReport, RagError> {
        let mut mentions = Vec::new();
        for extractor in &self.entity_extractors {
            mentions.extend(extractor.extract(document).await?);
        }

        let ts_extracted = Utc::now();
        let mut nodes_upserted = 0usize;
        for mention in &mentions {
            let node = GraphNode {
                id: GraphNode::compose_id(&document.tenant_id, &mention.entity_type, &mention.surface),
                node_type: mention.entity_type.clone(),
                summary: mention.surface.clone(),
                tenant_id: document.tenant_id.clone(),
                provenance: Provenance {
                    document_id: document.id.clone(),
                    source_tool: document.source_tool.clone(),
                    ts_extracted,
                },
            };
            self.graph.upsert_node(&node).await?;
            nodes_upserted += 1;
        }

        let mut relations = Vec::new();
        for extractor in &self.relation_extractors {
            relations.extend(extractor.extract(document, &mentions).await?);
        }

        let mut edges_created = 0usize;
        let mut conflicts = Vec::new();
        for relation in relations {
            let (created, mut events) = self.store_relation(document, &relation, ts_extracted).await?;
            edges_created += created;
            conflicts.append(&mut events);
        }

        info!(
            doc_id = %document.id,
            nodes = nodes_upserted,
            edges = edges_created,
            conflicts = conflicts.len(),
            "graph updated"
        );
        Ok(GraphReport {
            document_id: document.id.clone(),
            nodes_upserted,
            edges_created,
            conflicts,
        })
    }

    async fn store_relation(
        &self,
        document: &Document,
        relation: &RelationMention,
        ts_extracted: DateTime<Utc>,
    ) -> Result<(usize, Vec<ConflictResolution>), RagError> {
        let source_id = GraphNode::compose_id(
            &document.tenant_id,
            &relation.source.entity_type,
            &relation.source.surface,
        );
        let target_id = GraphNode::compose_id(
            &document.tenant_id,
            &relation.target.entity_type,
            &relation.target.surface,
        );

        let t_valid_start = document.ts_source;
        let t_valid_end = t_valid_start + Duration::days(DEFAULT_VALIDITY_DAYS);
        let new_edge = GraphEdge {
            id: GraphEdge::compose_id(&source_id, &relation.relation_type, &target_id, t_valid_start),
            source_id: source_id.clone(),
            target_id: target_id.clone(),
            edge_type: relation.relation_type.clone(),
            t_valid_start,
            t_valid_end,
            confidence: relation.confidence,
            tenant_id: document.tenant_id.clone(),
            provenance: Provenance {
                document_id: document.id.clone(),
                source_tool: document.source_tool.clone(),
                ts_extracted,
            },
        };

        let lock = self.relation_lock(&new_edge.relation_key()).await;
        let _guard = lock.lock().await;

        let existing = self
            .graph
            .edges_between(&source_id, &relation.relation_type, &target_id)
            .await?;
        let (ops, events) = resolve_conflicts(new_edge, &existing);

        let mut created = 0usize;
        for op in ops {
            match op {
                EdgeOp::Truncate { mut edge, new_end } => {
                    edge.t_valid_end = new_end;
                    self.graph.update_edge(&edge).await?;
                }
                EdgeOp::Delete { edge_id } => self.graph.delete_edge(&edge_id).await?,
                EdgeOp::Insert(edge) => {
                    self.graph.create_edge(&edge).await?;
                    created += 1;
                }
            }
        }
        for event in &events {
            debug!(?event, "edge conflict resolved");
        }
        Ok((created, events))
    }
}
