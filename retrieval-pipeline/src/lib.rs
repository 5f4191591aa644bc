pub mod fusion;
pub mod generator;
pub mod hybrid;
pub mod reranker;

#[cfg(feature = "fastembed")]
pub mod fastembed_rerank;

use common::types::{Chunk, GraphEdge};
use serde::{Deserialize, Serialize};

/// One candidate flowing through retrieval → rerank → grounding: a chunk
/// hit or a graph-derived pseudo-chunk flagged `type = edge`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContextItem {
    Chunk { chunk: Chunk },
    Edge { edge: GraphEdge },
}

/// The surface segment of a `tenant:type:surface` node id.
fn surface_of(node_id: &str) -> &str {
    node_id.splitn(3, ':').nth(2).unwrap_or(node_id)
}

impl ContextItem {
    pub fn id(&self) -> &str {
        match self {
            Self::Chunk { chunk } => &chunk.chunk_id,
            Self::Edge { edge } => &edge.id,
        }
    }

    /// Text used for scoring and evidence accounting.
    pub fn display_text(&self) -> String {
        match self {
            Self::Chunk { chunk } => chunk.text.clone(),
            Self::Edge { edge } => format!(
                "{} {} {}",
                surface_of(&edge.source_id),
                edge.edge_type,
                surface_of(&edge.target_id)
            ),
        }
    }

    pub fn source_tool(&self) -> &str {
        match self {
            Self::Chunk { chunk } => &chunk.source_tool,
            Self::Edge { edge } => &edge.provenance.source_tool,
        }
    }
}

/// Candidate plus its current score (RRF-fused, then reranked).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedItem {
    pub item: ContextItem,
    pub score: f64,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::{DateTime, Utc};
    use common::types::Provenance;

    pub fn chunk_item(id: &str, text: &str, ts_source: DateTime<Utc>) -> ContextItem {
        ContextItem::Chunk {
            chunk: Chunk {
                chunk_id: id.to_owned(),
                doc_id: "acme:crm:doc".into(),
                text: text.to_owned(),
                tokens: text.split_whitespace().count(),
                tenant_id: "acme".into(),
                source_tool: "crm".into(),
                source_id: "doc".into(),
                acl: vec!["tenant:acme".into()],
                ts_source,
                ts_chunked: Utc::now(),
                chunker_version: "1.0".into(),
                embedding: None,
                embedding_model: None,
                embedding_version: None,
                ts_embedded: None,
            },
        }
    }

    pub fn edge_item(
        relation: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ContextItem {
        ContextItem::Edge {
            edge: GraphEdge {
                id: GraphEdge::compose_id("acme:person:Ada", relation, "acme:org:Initech", start),
                source_id: "acme:person:Ada".into(),
                target_id: "acme:org:Initech".into(),
                edge_type: relation.to_owned(),
                t_valid_start: start,
                t_valid_end: end,
                confidence: 0.9,
                tenant_id: "acme".into(),
                provenance: Provenance {
                    document_id: "acme:crm:doc".into(),
                    source_tool: "crm".into(),
                    ts_extracted: Utc::now(),
                },
            },
        }
    }
}
