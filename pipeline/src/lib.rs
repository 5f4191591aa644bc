//! Pipeline orchestrator: composes the tool host, ingestion worker, sinks
//! and retrieval stack into `ingest(source) → documents` and
//! `query(q) → answer + citations`, with a typestate query lifecycle
//! (`Received → Retrieved → Reranked → Generating → Done | Refused |
//! Cancelled`). Everything is constructed explicitly at boot and shared by
//! reference.

pub mod observability;
pub mod state;

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::Instant,
};

use common::{
    config::GroundingSettings,
    error::RagError,
    queue::{QueueClient, QueueMessage, TOPIC_INGESTION, TOPIC_INGESTION_DLQ},
    storage::{GraphStore, SearchFilters, TextIndex, VectorStore},
    types::{Document, GroundedAnswer, HybridQuery, SourceEvent, StreamFrame},
};
use futures::{stream::BoxStream, StreamExt};
use ingestion_pipeline::{GraphSink, IngestionWorker, SyncReport, TextSink};
use retrieval_pipeline::{
    generator::{evidence_score, GroundedGenerator},
    hybrid::HybridRetriever,
    reranker::Reranker,
};
use serde::Serialize;
use serde_json::json;
use state_machines::core::GuardError;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tool_host::ToolHost;
use tracing::{debug, info, instrument, warn};

use observability::{MetricsSnapshot, Observability};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Health {
    pub status: bool,
    pub components: BTreeMap<String, bool>,
}

/// Everything the orchestrator composes. Built once at boot.
pub struct PipelineDeps {
    pub host: Arc<ToolHost>,
    pub worker: Arc<IngestionWorker>,
    pub text_sink: Arc<TextSink>,
    pub graph_sink: Arc<GraphSink>,
    pub retriever: HybridRetriever,
    pub reranker: Reranker,
    pub generator: GroundedGenerator,
    pub grounding: GroundingSettings,
    pub queue: Arc<dyn QueueClient>,
    pub vector_store: Arc<dyn VectorStore>,
    pub text_index: Arc<dyn TextIndex>,
    pub graph: Arc<dyn GraphStore>,
    pub max_concurrent: usize,
}

pub struct RagPipeline {
    deps: PipelineDeps,
    metrics: Arc<Observability>,
    doc_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

fn map_guard_error(event: &str, guard: &GuardError) -> RagError {
    RagError::Internal(format!("invalid query transition during {event}: {guard:?}"))
}

impl RagPipeline {
    pub fn new(deps: PipelineDeps) -> Arc<Self> {
        Arc::new(Self {
            deps,
            metrics: Arc::new(Observability::new()),
            doc_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn host(&self) -> &Arc<ToolHost> {
        &self.deps.host
    }

    /// Pull sync through the tool host: normalize, enqueue, checkpoint.
    pub async fn ingest_source(
        &self,
        tool_id: &str,
        tenant_id: &str,
        params: serde_json::Value,
        incremental: bool,
    ) -> Result<SyncReport, RagError> {
        self.deps
            .worker
            .run_ingestion(tool_id, tenant_id, params, incremental)
            .await
    }

    /// Single pushed event from the HTTP collaborator.
    pub async fn ingest_event(
        &self,
        event: &SourceEvent,
        tenant_id: &str,
    ) -> Result<Document, RagError> {
        self.deps
            .worker
            .process_event(&event.tool_id, &event.data, tenant_id)
            .await
    }

    async fn doc_lock(&self, doc_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.doc_locks.lock().await;
        locks
            .entry(doc_id.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// One queued document through both sinks. Writes for a given `doc_id`
    /// are serialized, so manifest transitions stay linearizable; duplicate
    /// deliveries collapse on the checksum inside the text sink.
    #[instrument(skip_all, fields(key = %message.key))]
    pub async fn process_message(&self, message: &QueueMessage) -> Result<(), RagError> {
        let document: Document = serde_json::from_value(message.value.clone())?;

        let lock = self.doc_lock(&document.id).await;
        let _guard = lock.lock().await;

        let started = Instant::now();
        match self.deps.text_sink.process_document(&document).await {
            Ok(report) => {
                self.metrics.index.record(started.elapsed());
                debug!(
                    doc_id = %document.id,
                    chunks = report.chunk_count,
                    deleted = report.deleted,
                    reembedded = report.reembedded,
                    "text sink done"
                );
            }
            Err(err) => {
                self.metrics.index.record_error();
                return Err(err);
            }
        }

        let started = Instant::now();
        match self.deps.graph_sink.process_document(&document).await {
            Ok(report) => {
                self.metrics.graph.record(started.elapsed());
                debug!(
                    doc_id = %document.id,
                    nodes = report.nodes_upserted,
                    edges = report.edges_created,
                    "graph sink done"
                );
            }
            Err(err) => {
                self.metrics.graph.record_error();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Consumes the ingestion topic until cancelled: bounded concurrency
    /// across documents, serialized writes per document, failures
    /// dead-lettered.
    pub async fn run_consumer(self: Arc<Self>, cancel: CancellationToken) -> Result<(), RagError> {
        let mut rx = self.deps.queue.subscribe(TOPIC_INGESTION).await?;
        let semaphore = Arc::new(Semaphore::new(self.deps.max_concurrent.max(1)));
        info!(max_concurrent = self.deps.max_concurrent, "ingestion consumer started");

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("ingestion consumer cancelled");
                    break;
                }
                message = rx.recv() => {
                    let Some(message) = message else { break };
                    let permit = semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|_| RagError::Cancelled)?;
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(err) = this.process_message(&message).await {
                            warn!(key = %message.key, error = %err, "ingestion message failed");
                            let record = json!({
                                "key": message.key,
                                "value": message.value,
                                "error": err.to_string(),
                                "error_kind": err.kind(),
                                "timestamp": chrono::Utc::now().to_rfc3339(),
                            });
                            if let Err(err) = this
                                .deps
                                .queue
                                .produce(TOPIC_INGESTION_DLQ, &message.key, record)
                                .await
                            {
                                warn!(error = %err, "failed to dead-letter message");
                            }
                        }
                    });
                }
            }
        }
        Ok(())
    }

    fn build_filters(&self, request: &HybridQuery, tenant_id: &str) -> SearchFilters {
        let mut filters = SearchFilters::for_tenant(tenant_id);
        if let Some(requested) = &request.filters {
            filters.acl = requested.acl.clone();
            filters.time_window = requested.time_window;
        }
        filters
    }

    #[instrument(skip_all, fields(tenant_id = %tenant_id, use_graph = request.use_graph))]
    pub async fn query(
        &self,
        request: &HybridQuery,
        tenant_id: &str,
    ) -> Result<GroundedAnswer, RagError> {
        let machine = state::received();
        let filters = self.build_filters(request, tenant_id);

        let started = Instant::now();
        let retrieval = if request.use_graph {
            self.deps
                .retriever
                .retrieve_with_graph(&request.query, &filters, None)
                .await
        } else {
            self.deps.retriever.retrieve(&request.query, &filters, None).await
        };
        let candidates = match retrieval {
            Ok(candidates) => {
                self.metrics.retrieve.record(started.elapsed());
                candidates
            }
            Err(err) => {
                self.metrics.retrieve.record_error();
                return Err(err);
            }
        };
        let machine = machine
            .retrieve()
            .map_err(|(_, guard)| map_guard_error("retrieve", &guard))?;

        let started = Instant::now();
        let reranked = match self
            .deps
            .reranker
            .rerank(&request.query, candidates, tenant_id, request.top_k)
            .await
        {
            Ok(reranked) => {
                self.metrics.rerank.record(started.elapsed());
                reranked
            }
            Err(err) => {
                self.metrics.rerank.record_error();
                return Err(err);
            }
        };
        let machine = machine
            .rerank()
            .map_err(|(_, guard)| map_guard_error("rerank", &guard))?;

        let started = Instant::now();
        let answer = match self
            .deps
            .generator
            .generate(&request.query, &reranked.items)
            .await
        {
            Ok(answer) => {
                self.metrics.generate.record(started.elapsed());
                answer
            }
            Err(err) => {
                self.metrics.generate.record_error();
                return Err(err);
            }
        };

        if answer.has_sufficient_evidence {
            let machine = machine
                .generate()
                .map_err(|(_, guard)| map_guard_error("generate", &guard))?;
            machine
                .complete()
                .map_err(|(_, guard)| map_guard_error("complete", &guard))?;
        } else {
            machine
                .refuse()
                .map_err(|(_, guard)| map_guard_error("refuse", &guard))?;
        }

        info!(
            citations = answer.citations.len(),
            sufficient = answer.has_sufficient_evidence,
            "query answered"
        );
        Ok(answer)
    }

    /// Streaming query. Frames follow the generator contract: the token
    /// stream unchanged, then a final `citations` frame; cancellation at
    /// any stage emits a terminal `cancelled` frame.
    pub fn query_stream(
        self: &Arc<Self>,
        request: HybridQuery,
        tenant_id: String,
        cancel: CancellationToken,
    ) -> BoxStream<'static, StreamFrame> {
        let this = Arc::clone(self);
        Box::pin(async_stream::stream! {
            let machine = state::received();
            if cancel.is_cancelled() {
                let _ = machine.cancel();
                yield StreamFrame::cancelled();
                return;
            }

            let filters = this.build_filters(&request, &tenant_id);
            let retrieval = if request.use_graph {
                this.deps
                    .retriever
                    .retrieve_with_graph(&request.query, &filters, None)
                    .await
            } else {
                this.deps.retriever.retrieve(&request.query, &filters, None).await
            };
            let candidates = match retrieval {
                Ok(candidates) => candidates,
                Err(err) => {
                    yield StreamFrame::error(err.kind(), err.to_string());
                    return;
                }
            };
            let Ok(machine) = machine.retrieve() else {
                yield StreamFrame::error("internal", "invalid query transition");
                return;
            };
            if cancel.is_cancelled() {
                let _ = machine.cancel();
                yield StreamFrame::cancelled();
                return;
            }

            let reranked = match this
                .deps
                .reranker
                .rerank(&request.query, candidates, &tenant_id, request.top_k)
                .await
            {
                Ok(reranked) => reranked,
                Err(err) => {
                    yield StreamFrame::error(err.kind(), err.to_string());
                    return;
                }
            };
            let Ok(machine) = machine.rerank() else {
                yield StreamFrame::error("internal", "invalid query transition");
                return;
            };
            if cancel.is_cancelled() {
                let _ = machine.cancel();
                yield StreamFrame::cancelled();
                return;
            }

            let sufficient =
                evidence_score(&reranked.items) >= this.deps.grounding.min_evidence_score;
            let inner = this.deps.generator.generate_stream(
                request.query.clone(),
                reranked.items,
                cancel.clone(),
            );
            tokio::pin!(inner);
            while let Some(frame) = inner.next().await {
                yield frame;
            }

            if sufficient {
                if let Ok(machine) = machine.generate() {
                    if cancel.is_cancelled() {
                        let _ = machine.cancel();
                    } else {
                        let _ = machine.complete();
                    }
                }
            } else {
                let _ = machine.refuse();
            }
        })
    }

    /// Per-component health booleans plus overall status.
    pub async fn health(&self) -> Health {
        let mut components = BTreeMap::new();
        for (server_id, healthy) in self.deps.host.health_check().await {
            components.insert(format!("mcp:{server_id}"), healthy);
        }
        components.insert("queue".to_owned(), self.deps.queue.healthy().await);
        components.insert("vector_store".to_owned(), self.deps.vector_store.healthy().await);
        components.insert("text_index".to_owned(), self.deps.text_index.healthy().await);
        components.insert("graph".to_owned(), self.deps.graph.healthy().await);

        Health {
            status: components.values().all(|healthy| *healthy),
            components,
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
