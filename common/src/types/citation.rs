use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidityWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Evidence reference attached to a grounded answer. Bound to either a
/// retrieved chunk or a temporal graph edge.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "ref_type", rename_all = "snake_case")]
pub enum Citation {
    Chunk {
        chunk_id: String,
        doc_id: String,
        source_tool: String,
        ts_source: DateTime<Utc>,
    },
    Edge {
        edge_id: String,
        relation: String,
        validity: ValidityWindow,
        source_tool: String,
    },
}
