//! Worker binary: loads configuration, wires providers, stores, tool host
//! and pipelines explicitly, then runs the ingestion consumer until
//! shutdown. The HTTP surface is a separate collaborator; this process
//! owns ingestion and query execution.

use std::{path::Path, sync::Arc, time::Duration};

use common::{
    audit::FileAuditLog,
    checkpoint::FileCheckpointStore,
    config::{get_config, TransportKind},
    providers::{
        hashing::HashEmbedder,
        openai::{OpenAiChatModel, OpenAiEmbeddingModel},
        ChatModel, CrossEncoderModel, EmbeddingModel,
    },
    queue::MemoryQueue,
    storage::memory::{
        MemoryCache, MemoryGraphStore, MemoryManifestStore, MemoryTextIndex, MemoryVectorStore,
    },
};
use ingestion_pipeline::{Embedder, GraphSink, IngestionWorker, Normalizer, TextSink};
use pipeline::{PipelineDeps, RagPipeline};
use retrieval_pipeline::{
    generator::GroundedGenerator, hybrid::HybridRetriever, reranker::Reranker,
};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tool_host::{
    transport::{http_sse::HttpSseTransport, stdio::StdioTransport},
    ToolHost, Transport,
};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use async_openai::config::OpenAIConfig;
use common::error::RagError;

/// No-op cross-encoder used when no reranking model is configured; the
/// feature adjustments still order candidates.
struct PassthroughScorer {
    model_name: String,
}

#[async_trait::async_trait]
impl CrossEncoderModel for PassthroughScorer {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn score_pairs(
        &self,
        _query: &str,
        documents: &[String],
    ) -> Result<Vec<f64>, RagError> {
        Ok(documents.iter().map(|_| 0.0).collect())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;
    tokio::fs::create_dir_all(&config.data_dir).await?;

    // Providers. Without an API key the deterministic hash embedder keeps
    // the pipeline operational for local runs.
    let embedding_model: Arc<dyn EmbeddingModel> = if config.openai_api_key.is_empty() {
        warn!("no API key configured; using the deterministic hash embedder");
        Arc::new(HashEmbedder::new(config.embedding_dimensions as usize))
    } else {
        let client = async_openai::Client::with_config(
            OpenAIConfig::new()
                .with_api_key(&config.openai_api_key)
                .with_api_base(&config.openai_base_url),
        );
        Arc::new(OpenAiEmbeddingModel::new(
            client,
            config.embedding_model.clone(),
            config.embedding_dimensions,
        ))
    };
    let chat_client = async_openai::Client::with_config(
        OpenAIConfig::new()
            .with_api_key(&config.openai_api_key)
            .with_api_base(&config.openai_base_url),
    );
    let chat_model: Arc<dyn ChatModel> =
        Arc::new(OpenAiChatModel::new(chat_client, config.chat_model.clone()));
    let cross_encoder: Arc<dyn CrossEncoderModel> = Arc::new(PassthroughScorer {
        model_name: config.reranker.model_name.clone(),
    });

    // Stores: the in-memory reference backends. Vendor-backed stores slot
    // in behind the same contracts.
    let vector_store = Arc::new(MemoryVectorStore::new(embedding_model.clone()));
    let text_index = Arc::new(MemoryTextIndex::new());
    let graph = Arc::new(MemoryGraphStore::new());
    let manifests = Arc::new(MemoryManifestStore::new());
    let cache = Arc::new(MemoryCache::new());
    let queue = Arc::new(MemoryQueue::new());
    let checkpoints = Arc::new(
        FileCheckpointStore::open(Path::new(&config.data_dir).join("checkpoints.json")).await?,
    );
    let audit = Arc::new(FileAuditLog::new(
        Path::new(&config.data_dir).join("audit.jsonl"),
    ));

    // Tool host and adapters.
    let host = Arc::new(ToolHost::new(config.mcp.tenants.clone(), audit));
    let invoke_timeout = Duration::from_secs(config.invoke_timeout_secs);
    for server in &config.mcp.servers {
        let transport: Arc<dyn Transport> = match server.transport {
            TransportKind::Stdio => {
                let Some(command) = &server.command else {
                    warn!(server_id = %server.id, "stdio server without command; skipping");
                    continue;
                };
                Arc::new(StdioTransport::new(
                    command.clone(),
                    server.env.clone(),
                    invoke_timeout,
                ))
            }
            TransportKind::HttpSse => {
                let Some(base_url) = &server.base_url else {
                    warn!(server_id = %server.id, "http server without base_url; skipping");
                    continue;
                };
                Arc::new(HttpSseTransport::new(
                    base_url.clone(),
                    &server.auth_headers,
                    invoke_timeout,
                )?)
            }
        };
        match host.connect_server(&server.id, transport).await {
            Ok((tools, resources, prompts)) => {
                info!(server_id = %server.id, tools, resources, prompts, "adapter connected");
            }
            Err(err) => error!(server_id = %server.id, error = %err, "adapter connection failed"),
        }
    }

    // Pipelines.
    let permits = Arc::new(Semaphore::new(config.ingestion.max_concurrent.max(1)));
    let normalizer = Arc::new(Normalizer::new(config.normalizer.clone()));
    let text_sink = Arc::new(TextSink::new(
        vector_store.clone(),
        text_index.clone(),
        manifests,
        Embedder::new(embedding_model, 16, permits.clone()),
        &config.chunking,
    ));
    let graph_sink = Arc::new(GraphSink::new(graph.clone(), Vec::new(), Vec::new()));
    let worker = Arc::new(IngestionWorker::new(
        host.clone(),
        queue.clone(),
        checkpoints,
        normalizer,
        config.ingestion.clone(),
    ));
    let retriever = HybridRetriever::new(
        vector_store.clone(),
        text_index.clone(),
        Some(graph.clone()),
        config.retrieval.clone(),
    );
    let reranker = Reranker::new(
        cross_encoder,
        cache,
        Some(graph.clone()),
        config.reranker.clone(),
        permits,
    );
    let generator = GroundedGenerator::new(chat_model, config.grounding.clone());

    let rag = RagPipeline::new(PipelineDeps {
        host,
        worker,
        text_sink,
        graph_sink,
        retriever,
        reranker,
        generator,
        grounding: config.grounding.clone(),
        queue,
        vector_store,
        text_index,
        graph,
        max_concurrent: config.ingestion.max_concurrent,
    });

    let health = rag.health().await;
    info!(status = health.status, components = ?health.components, "pipeline booted");

    let cancel = CancellationToken::new();
    let consumer = tokio::spawn(Arc::clone(&rag).run_consumer(cancel.clone()));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    cancel.cancel();
    if let Err(err) = consumer.await? {
        error!(error = %err, "consumer exited with error");
    }

    Ok(())
}
