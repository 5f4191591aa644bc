//! Canonicalizes tool payloads into `Document`s: PII scrub, ACL mapping,
//! timestamp extraction and checksum computation. Every step is
//! deterministic and `normalize(normalize(x)) == normalize(x)`.

mod acl;
mod pii;

pub use acl::AclMapper;
pub use pii::PiiScrubber;

use chrono::{DateTime, TimeZone, Utc};
use common::{
    config::NormalizerSettings,
    error::RagError,
    types::Document,
    utils::hash::{content_hash, md5_hex},
};
use serde_json::{json, Map, Value};

pub struct Normalizer {
    settings: NormalizerSettings,
    scrubber: PiiScrubber,
    acl_mapper: AclMapper,
}

impl Normalizer {
    pub fn new(settings: NormalizerSettings) -> Self {
        let scrubber = PiiScrubber::new(&settings.custom_patterns);
        let acl_mapper = AclMapper::new(&settings.acl_mappings);
        Self {
            settings,
            scrubber,
            acl_mapper,
        }
    }

    pub fn normalize(
        &self,
        payload: &Value,
        source_tool: &str,
        tenant_id: &str,
    ) -> Result<Document, RagError> {
        if tenant_id.is_empty() || source_tool.is_empty() {
            return Err(RagError::SchemaInvalid(
                "normalization requires tenant_id and source_tool".into(),
            ));
        }
        let Some(fields) = payload.as_object() else {
            return Err(RagError::SchemaInvalid(
                "payload must be a JSON object".into(),
            ));
        };

        let source_id = extract_string(fields, &["source_id", "id"])
            .unwrap_or_else(|| md5_hex(common::utils::hash::canonical_json(payload).as_bytes()));

        let raw_content = extract_string(fields, &["content", "text"]).unwrap_or_default();
        // Scrubbing runs before the checksum so identical inputs always
        // yield identical checksums.
        let content = if self.settings.scrub_pii {
            self.scrubber.scrub(&raw_content)
        } else {
            raw_content
        };

        let metadata = fields
            .get("metadata")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let source_acls: Vec<String> = fields
            .get("acl")
            .and_then(Value::as_array)
            .map(|values| {
                values
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();
        let acl = self.acl_mapper.map(&source_acls, source_tool, tenant_id);

        let ts_source = extract_timestamp(fields, &["ts_source", "timestamp", "created_at"])
            .unwrap_or_else(Utc::now);

        let checksum = checksum_for(&source_id, &content, &metadata, ts_source);

        Ok(Document {
            id: Document::compose_id(tenant_id, source_tool, &source_id),
            tenant_id: tenant_id.to_owned(),
            source_tool: source_tool.to_owned(),
            source_id,
            content,
            metadata,
            acl,
            ts_source,
            ts_ingested: Utc::now(),
            checksum,
            schema_version: self.settings.schema_version.clone(),
        })
    }
}

/// MD5 over the canonical JSON of the identity-bearing fields.
pub fn checksum_for(
    source_id: &str,
    content: &str,
    metadata: &Map<String, Value>,
    ts_source: DateTime<Utc>,
) -> String {
    content_hash(&json!({
        "source_id": source_id,
        "content": content,
        "metadata": metadata,
        "ts_source": ts_source.to_rfc3339(),
    }))
}

fn extract_string(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    for key in keys {
        match fields.get(*key) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

fn extract_timestamp(fields: &Map<String, Value>, keys: &[&str]) -> Option<DateTime<Utc>> {
    for key in keys {
        match fields.get(*key) {
            Some(Value::String(s)) => {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
                    return Some(parsed.with_timezone(&Utc));
                }
            }
            Some(Value::Number(n)) => {
                if let Some(secs) = n.as_i64() {
                    if let Some(parsed) = Utc.timestamp_opt(secs, 0).single() {
                        return Some(parsed);
                    }
                }
            }
            _ => {}
        }
    }
    None
}
