use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Canonical record produced by the normalizer. Immutable once the checksum
/// is computed; a re-ingest with a different checksum supersedes the prior
/// version's chunks via the manifest delta.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub id: String,
    pub tenant_id: String,
    pub source_tool: String,
    pub source_id: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default)]
    pub acl: Vec<String>,
    pub ts_source: DateTime<Utc>,
    pub ts_ingested: DateTime<Utc>,
    pub checksum: String,
    pub schema_version: String,
}

impl Document {
    pub fn compose_id(tenant_id: &str, source_tool: &str, source_id: &str) -> String {
        format!("{tenant_id}:{source_tool}:{source_id}")
    }

    /// Key under which duplicate deliveries collapse on the queue.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.tenant_id, self.source_id)
    }
}
