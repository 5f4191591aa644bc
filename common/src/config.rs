use std::collections::{BTreeMap, HashMap};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use tracing::warn;

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Stdio,
    HttpSse,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerSettings {
    pub id: String,
    pub transport: TransportKind,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub auth_headers: HashMap<String, String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct UserSettings {
    #[serde(default)]
    pub allowed_tools: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct TenantSettings {
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub users: HashMap<String, UserSettings>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct McpSettings {
    #[serde(default)]
    pub servers: Vec<ServerSettings>,
    #[serde(default)]
    pub tenants: HashMap<String, TenantSettings>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct IngestionSettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay in seconds before the first retry.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: f64,
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: f64,
    /// Multiplicative jitter, applied as a factor in `1.0 ± retry_jitter`.
    #[serde(default = "default_retry_jitter")]
    pub retry_jitter: f64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay() -> f64 {
    1.0
}
fn default_retry_backoff() -> f64 {
    2.0
}
fn default_retry_jitter() -> f64 {
    0.1
}
fn default_max_concurrent() -> usize {
    5
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            retry_backoff: default_retry_backoff(),
            retry_jitter: default_retry_jitter(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChunkingSettings {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    /// When set, multi-size chunking runs once per size.
    #[serde(default)]
    pub chunk_sizes: Option<Vec<usize>>,
    #[serde(default = "default_overlap_ratio")]
    pub overlap_ratio: f64,
}

fn default_chunk_size() -> usize {
    300
}
fn default_chunk_overlap() -> usize {
    50
}
fn default_overlap_ratio() -> f64 {
    0.1
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            chunk_sizes: None,
            overlap_ratio: default_overlap_ratio(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RetrievalSettings {
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    #[serde(default = "default_weight")]
    pub vector_weight: f64,
    #[serde(default = "default_weight")]
    pub bm25_weight: f64,
    #[serde(default = "default_retrieval_top_k")]
    pub top_k: usize,
}

fn default_rrf_k() -> f64 {
    60.0
}
fn default_weight() -> f64 {
    1.0
}
fn default_retrieval_top_k() -> usize {
    50
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            vector_weight: default_weight(),
            bm25_weight: default_weight(),
            top_k: default_retrieval_top_k(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RerankerSettings {
    #[serde(default = "default_reranker_model")]
    pub model_name: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: u64,
    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,
    #[serde(default = "default_entity_weight")]
    pub entity_weight: f64,
    #[serde(default)]
    pub quality_threshold: f64,
    #[serde(default = "default_rerank_top_k")]
    pub top_k: usize,
}

fn default_reranker_model() -> String {
    "cross-encoder/ms-marco-MiniLM-L-6-v2".to_owned()
}
fn default_batch_size() -> usize {
    16
}
fn default_cache_ttl() -> u64 {
    3600
}
fn default_recency_weight() -> f64 {
    0.1
}
fn default_entity_weight() -> f64 {
    0.2
}
fn default_rerank_top_k() -> usize {
    5
}

impl Default for RerankerSettings {
    fn default() -> Self {
        Self {
            model_name: default_reranker_model(),
            batch_size: default_batch_size(),
            cache_ttl: default_cache_ttl(),
            recency_weight: default_recency_weight(),
            entity_weight: default_entity_weight(),
            quality_threshold: 0.0,
            top_k: default_rerank_top_k(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct GroundingSettings {
    #[serde(default = "default_min_evidence_score")]
    pub min_evidence_score: f64,
}

fn default_min_evidence_score() -> f64 {
    0.7
}

impl Default for GroundingSettings {
    fn default() -> Self {
        Self {
            min_evidence_score: default_min_evidence_score(),
        }
    }
}

/// ACL mappings for one source tool. BTreeMaps keep mapping application
/// stable and ordered.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AclToolMappings {
    #[serde(default)]
    pub exact: BTreeMap<String, String>,
    #[serde(default)]
    pub patterns: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NormalizerSettings {
    #[serde(default = "default_scrub_pii")]
    pub scrub_pii: bool,
    /// User-supplied PII patterns, applied after the built-in set in sorted
    /// name order.
    #[serde(default)]
    pub custom_patterns: BTreeMap<String, String>,
    #[serde(default)]
    pub acl_mappings: HashMap<String, AclToolMappings>,
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
}

fn default_scrub_pii() -> bool {
    true
}
fn default_schema_version() -> String {
    "1.0".to_owned()
}

impl Default for NormalizerSettings {
    fn default() -> Self {
        Self {
            scrub_pii: default_scrub_pii(),
            custom_patterns: BTreeMap::new(),
            acl_mappings: HashMap::new(),
            schema_version: default_schema_version(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub mcp: McpSettings,
    #[serde(default)]
    pub ingestion: IngestionSettings,
    #[serde(default)]
    pub chunking: ChunkingSettings,
    #[serde(default)]
    pub retrieval: RetrievalSettings,
    #[serde(default)]
    pub reranker: RerankerSettings,
    #[serde(default)]
    pub grounding: GroundingSettings,
    #[serde(default)]
    pub normalizer: NormalizerSettings,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub openai_api_key: String,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: u32,
    #[serde(default = "default_invoke_timeout")]
    pub invoke_timeout_secs: u64,
}

fn default_data_dir() -> String {
    "./data".to_owned()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_owned()
}
fn default_chat_model() -> String {
    "gpt-4o-mini".to_owned()
}
fn default_embedding_model() -> String {
    "text-embedding-3-small".to_owned()
}
fn default_embedding_dimensions() -> u32 {
    1536
}
fn default_invoke_timeout() -> u64 {
    30
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mcp: McpSettings::default(),
            ingestion: IngestionSettings::default(),
            chunking: ChunkingSettings::default(),
            retrieval: RetrievalSettings::default(),
            reranker: RerankerSettings::default(),
            grounding: GroundingSettings::default(),
            normalizer: NormalizerSettings::default(),
            data_dir: default_data_dir(),
            openai_api_key: String::new(),
            openai_base_url: default_base_url(),
            chat_model: default_chat_model(),
            embedding_model: default_embedding_model(),
            embedding_dimensions: default_embedding_dimensions(),
            invoke_timeout_secs: default_invoke_timeout(),
        }
    }
}

const RECOGNIZED_SECTIONS: &[&str] = &[
    "mcp",
    "ingestion",
    "chunking",
    "retrieval",
    "reranker",
    "grounding",
    "normalizer",
    "data_dir",
    "openai_api_key",
    "openai_base_url",
    "chat_model",
    "embedding_model",
    "embedding_dimensions",
    "invoke_timeout_secs",
];

pub fn get_config() -> Result<AppConfig, ConfigError> {
    // Unknown file keys are ignored, but flag them so typos surface.
    if let Ok(file_only) = Config::builder()
        .add_source(File::with_name("config").required(false))
        .build()
    {
        if let Ok(value) = file_only.try_deserialize::<serde_json::Map<String, serde_json::Value>>()
        {
            for key in value.keys() {
                if !RECOGNIZED_SECTIONS.contains(&key.as_str()) {
                    warn!(%key, "unrecognized configuration key; ignoring");
                }
            }
        }
    }

    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_stable() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.ingestion.max_retries, 3);
        assert!((cfg.ingestion.retry_delay - 1.0).abs() < f64::EPSILON);
        assert!((cfg.ingestion.retry_backoff - 2.0).abs() < f64::EPSILON);
        assert!((cfg.ingestion.retry_jitter - 0.1).abs() < f64::EPSILON);
        assert_eq!(cfg.ingestion.max_concurrent, 5);
        assert_eq!(cfg.chunking.chunk_size, 300);
        assert_eq!(cfg.chunking.chunk_overlap, 50);
        assert!((cfg.retrieval.rrf_k - 60.0).abs() < f64::EPSILON);
        assert_eq!(cfg.retrieval.top_k, 50);
        assert_eq!(cfg.reranker.batch_size, 16);
        assert_eq!(cfg.reranker.cache_ttl, 3600);
        assert!((cfg.reranker.recency_weight - 0.1).abs() < f64::EPSILON);
        assert!((cfg.reranker.entity_weight - 0.2).abs() < f64::EPSILON);
        assert_eq!(cfg.reranker.top_k, 5);
        assert!((cfg.grounding.min_evidence_score - 0.7).abs() < f64::EPSILON);
        assert_eq!(cfg.invoke_timeout_secs, 30);
    }

    #[test]
    fn tenant_settings_deserialize_from_nested_maps() {
        let json = serde_json::json!({
            "servers": [{
                "id": "crm",
                "transport": "stdio",
                "command": "crm-adapter --stdio"
            }],
            "tenants": {
                "acme": {
                    "allowed_tools": ["crm.list_leads"],
                    "users": {"ada": {"allowed_tools": ["crm.list_leads"]}}
                }
            }
        });
        let mcp: McpSettings = serde_json::from_value(json).unwrap();
        assert_eq!(mcp.servers.len(), 1);
        assert_eq!(mcp.servers[0].transport, TransportKind::Stdio);
        assert_eq!(
            mcp.tenants["acme"].users["ada"].allowed_tools,
            vec!["crm.list_leads"]
        );
    }
}
