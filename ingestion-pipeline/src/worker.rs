//! Drives full and incremental sync through the tool host: pull sync with
//! exponential backoff and a dead-letter record on exhaustion, and stream
//! sync with per-event checkpointing. Fatal kinds (`PermissionDenied`,
//! `SchemaInvalid`) are caller errors: no retry, no DLQ.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use common::{
    checkpoint::CheckpointStore,
    config::IngestionSettings,
    error::RagError,
    queue::{QueueClient, TOPIC_INGESTION, TOPIC_INGESTION_DLQ},
    types::{Checkpoint, Document},
};
use futures::StreamExt;
use rand::Rng;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tool_host::{EventStream, SubscriptionEvent, ToolHost};
use tracing::{info, instrument, warn};

use crate::normalizer::Normalizer;

/// The slice of the tool host the worker needs; narrow so tests can script
/// failures.
#[async_trait]
pub trait ToolClient: Send + Sync {
    async fn invoke_tool(
        &self,
        tool_id: &str,
        params: Value,
        tenant_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<Value, RagError>;

    async fn subscribe_resource(
        &self,
        resource_id: &str,
        params: Value,
        tenant_id: Option<&str>,
        user_id: Option<&str>,
        last_event_id: Option<String>,
    ) -> Result<EventStream, RagError>;
}

#[async_trait]
impl ToolClient for ToolHost {
    async fn invoke_tool(
        &self,
        tool_id: &str,
        params: Value,
        tenant_id: Option<&str>,
        user_id: Option<&str>,
    ) -> Result<Value, RagError> {
        ToolHost::invoke_tool(self, tool_id, params, tenant_id, user_id).await
    }

    async fn subscribe_resource(
        &self,
        resource_id: &str,
        params: Value,
        tenant_id: Option<&str>,
        user_id: Option<&str>,
        last_event_id: Option<String>,
    ) -> Result<EventStream, RagError> {
        ToolHost::subscribe_resource(self, resource_id, params, tenant_id, user_id, last_event_id)
            .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub items_processed: usize,
    pub cursor: Option<String>,
}

pub struct IngestionWorker {
    tools: Arc<dyn ToolClient>,
    queue: Arc<dyn QueueClient>,
    checkpoints: Arc<dyn CheckpointStore>,
    normalizer: Arc<Normalizer>,
    settings: IngestionSettings,
}

impl IngestionWorker {
    pub fn new(
        tools: Arc<dyn ToolClient>,
        queue: Arc<dyn QueueClient>,
        checkpoints: Arc<dyn CheckpointStore>,
        normalizer: Arc<Normalizer>,
        settings: IngestionSettings,
    ) -> Self {
        Self {
            tools,
            queue,
            checkpoints,
            normalizer,
            settings,
        }
    }

    /// Delay before retry `attempt` (1-based): `retry_delay ·
    /// retry_backoff^(attempt−1)`, with multiplicative `±retry_jitter`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.settings.retry_delay
            * self
                .settings
                .retry_backoff
                .powi(i32::try_from(attempt).unwrap_or(i32::MAX).saturating_sub(1));
        let jitter = self.settings.retry_jitter.abs();
        let factor = if jitter > 0.0 {
            1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64((base * factor).max(0.0))
    }

    #[instrument(skip_all, fields(tool_id = %tool_id, tenant_id = %tenant_id, incremental))]
    pub async fn run_ingestion(
        &self,
        tool_id: &str,
        tenant_id: &str,
        params: Value,
        incremental: bool,
    ) -> Result<SyncReport, RagError> {
        let mut params = if params.is_object() {
            params
        } else {
            Value::Object(Default::default())
        };
        if incremental {
            if let Some(Checkpoint::Cursor { cursor, .. }) =
                self.checkpoints.get(tool_id).await?
            {
                params["cursor"] = Value::String(cursor);
            }
        }

        let mut attempt: u32 = 0;
        loop {
            match self
                .tools
                .invoke_tool(tool_id, params.clone(), Some(tenant_id), None)
                .await
            {
                Ok(response) => return self.drain_items(tool_id, tenant_id, &response).await,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    if attempt >= self.settings.max_retries {
                        warn!(
                            tool_id,
                            retries = attempt,
                            error = %err,
                            "ingestion exhausted retries; dead-lettering"
                        );
                        self.dead_letter_sync(tool_id, tenant_id, &params, &err, attempt)
                            .await;
                        return Err(err);
                    }
                    attempt += 1;
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        tool_id,
                        attempt,
                        max_retries = self.settings.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "ingestion failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn drain_items(
        &self,
        tool_id: &str,
        tenant_id: &str,
        response: &Value,
    ) -> Result<SyncReport, RagError> {
        let mut items_processed = 0usize;
        for item in response
            .get("items")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let document = self.normalizer.normalize(item, tool_id, tenant_id)?;
            self.enqueue_document(&document).await?;
            items_processed += 1;
        }

        let cursor = response
            .get("cursor")
            .and_then(Value::as_str)
            .map(str::to_owned);
        if let Some(cursor) = &cursor {
            self.checkpoints
                .put(tool_id, Checkpoint::cursor(cursor.clone()))
                .await?;
        }

        info!(tool_id, items_processed, has_cursor = cursor.is_some(), "pull sync complete");
        Ok(SyncReport {
            items_processed,
            cursor,
        })
    }

    async fn enqueue_document(&self, document: &Document) -> Result<(), RagError> {
        self.queue
            .produce(
                TOPIC_INGESTION,
                &document.idempotency_key(),
                serde_json::to_value(document)?,
            )
            .await
    }

    async fn dead_letter_sync(
        &self,
        tool_id: &str,
        tenant_id: &str,
        params: &Value,
        error: &RagError,
        retry_count: u32,
    ) {
        let record = json!({
            "tool_id": tool_id,
            "tenant_id": tenant_id,
            "params": params,
            "error": error.to_string(),
            "error_kind": error.kind(),
            "retry_count": retry_count,
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Err(err) = self
            .queue
            .produce(TOPIC_INGESTION_DLQ, &format!("{tenant_id}:{tool_id}"), record)
            .await
        {
            warn!(tool_id, error = %err, "failed to dead-letter sync failure");
        }
    }

    /// Single pushed event, bypassing the adapter pull path. Returns the
    /// normalized document.
    pub async fn process_event(
        &self,
        tool_id: &str,
        data: &Value,
        tenant_id: &str,
    ) -> Result<Document, RagError> {
        let document = self.normalizer.normalize(data, tool_id, tenant_id)?;
        self.enqueue_document(&document).await?;
        Ok(document)
    }

    /// Consumes a subscription until the server closes it or `cancel`
    /// fires. Individual event failures are dead-lettered and skipped; the
    /// checkpoint is flushed on every exit path.
    #[instrument(skip_all, fields(resource_id = %resource_id, tenant_id = %tenant_id))]
    pub async fn start_streaming_ingestion(
        &self,
        resource_id: &str,
        tenant_id: &str,
        params: Value,
        cancel: CancellationToken,
    ) -> Result<u64, RagError> {
        let last_event_id = match self.checkpoints.get(resource_id).await? {
            Some(Checkpoint::Stream { last_event_id, .. }) => Some(last_event_id),
            _ => None,
        };

        let mut stream = self
            .tools
            .subscribe_resource(resource_id, params, Some(tenant_id), None, last_event_id)
            .await?;

        let mut processed = 0u64;
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!(resource_id, processed, "streaming ingestion cancelled");
                    break;
                }
                event = stream.next() => {
                    let Some(event) = event else {
                        info!(resource_id, processed, "stream closed by server");
                        break;
                    };
                    match event {
                        Ok(event) => {
                            if let Err(err) = self
                                .handle_stream_event(resource_id, tenant_id, &event)
                                .await
                            {
                                warn!(resource_id, error = %err, "event failed; dead-lettering");
                                self.dead_letter_event(resource_id, tenant_id, &event, &err)
                                    .await;
                                continue;
                            }
                            processed += 1;
                            if let Some(event_id) = &event.id {
                                self.checkpoints
                                    .put(resource_id, Checkpoint::stream(event_id.clone()))
                                    .await?;
                            }
                        }
                        Err(err) => {
                            warn!(resource_id, error = %err, "stream failed");
                            break;
                        }
                    }
                }
            }
        }

        if let Err(err) = self.checkpoints.flush().await {
            warn!(resource_id, error = %err, "failed to flush checkpoints");
        }
        Ok(processed)
    }

    async fn handle_stream_event(
        &self,
        resource_id: &str,
        tenant_id: &str,
        event: &SubscriptionEvent,
    ) -> Result<(), RagError> {
        let document = self
            .normalizer
            .normalize(&event.data, resource_id, tenant_id)?;
        self.enqueue_document(&document).await
    }

    async fn dead_letter_event(
        &self,
        resource_id: &str,
        tenant_id: &str,
        event: &SubscriptionEvent,
        error: &RagError,
    ) {
        let record = json!({
            "resource_id": resource_id,
            "tenant_id": tenant_id,
            "event": event.data,
            "event_id": event.id,
            "error": error.to_string(),
            "error_kind": error.kind(),
            "timestamp": Utc::now().to_rfc3339(),
        });
        if let Err(err) = self
            .queue
            .produce(
                TOPIC_INGESTION_DLQ,
                &format!("{tenant_id}:{resource_id}"),
                record,
            )
            .await
        {
            warn!(resource_id, error = %err, "failed to dead-letter event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{
        checkpoint::MemoryCheckpointStore,
        config::NormalizerSettings,
        queue::MemoryQueue,
    };
    use std::sync::Mutex as StdMutex;
    use tokio::time::Instant;

    /// Scripted tool client: pops one response per invocation and records
    /// the instant and params of each call.
    struct ScriptedTools {
        responses: StdMutex<Vec<Result<Value, RagError>>>,
        calls: StdMutex<Vec<(Instant, Value)>>,
        events: Vec<SubscriptionEvent>,
    }

    impl ScriptedTools {
        fn new(responses: Vec<Result<Value, RagError>>) -> Self {
            Self {
                responses: StdMutex::new(responses),
                calls: StdMutex::new(Vec::new()),
                events: Vec::new(),
            }
        }

        fn with_events(events: Vec<SubscriptionEvent>) -> Self {
            Self {
                responses: StdMutex::new(Vec::new()),
                calls: StdMutex::new(Vec::new()),
                events,
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }

        fn call_instants(&self) -> Vec<Instant> {
            self.calls.lock().unwrap().iter().map(|(t, _)| *t).collect()
        }

        fn call_params(&self) -> Vec<Value> {
            self.calls.lock().unwrap().iter().map(|(_, p)| p.clone()).collect()
        }
    }

    #[async_trait]
    impl ToolClient for ScriptedTools {
        async fn invoke_tool(
            &self,
            _tool_id: &str,
            params: Value,
            _tenant_id: Option<&str>,
            _user_id: Option<&str>,
        ) -> Result<Value, RagError> {
            self.calls.lock().unwrap().push((Instant::now(), params));
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(json!({"items": []}))
            } else {
                responses.remove(0)
            }
        }

        async fn subscribe_resource(
            &self,
            _resource_id: &str,
            _params: Value,
            _tenant_id: Option<&str>,
            _user_id: Option<&str>,
            _last_event_id: Option<String>,
        ) -> Result<EventStream, RagError> {
            let events: Vec<Result<SubscriptionEvent, RagError>> =
                self.events.iter().cloned().map(Ok).collect();
            Ok(Box::pin(futures::stream::iter(events)))
        }
    }

    struct Fixture {
        tools: Arc<ScriptedTools>,
        queue: Arc<MemoryQueue>,
        checkpoints: Arc<MemoryCheckpointStore>,
        worker: IngestionWorker,
    }

    fn fixture(tools: ScriptedTools, settings: IngestionSettings) -> Fixture {
        let tools = Arc::new(tools);
        let queue = Arc::new(MemoryQueue::new());
        let checkpoints = Arc::new(MemoryCheckpointStore::new());
        let worker = IngestionWorker::new(
            tools.clone(),
            queue.clone(),
            checkpoints.clone(),
            Arc::new(Normalizer::new(NormalizerSettings::default())),
            settings,
        );
        Fixture {
            tools,
            queue,
            checkpoints,
            worker,
        }
    }

    fn no_jitter_settings() -> IngestionSettings {
        IngestionSettings {
            retry_jitter: 0.0,
            ..IngestionSettings::default()
        }
    }

    fn timeout_err() -> RagError {
        RagError::Timeout(Duration::from_secs(30))
    }

    #[tokio::test]
    async fn successful_sync_enqueues_items_and_checkpoints_cursor() {
        let fx = fixture(
            ScriptedTools::new(vec![Ok(json!({
                "items": [
                    {"id": "lead-1", "content": "first", "ts_source": "2024-01-01T00:00:00Z"},
                    {"id": "lead-2", "content": "second", "ts_source": "2024-01-01T00:00:00Z"}
                ],
                "cursor": "page-2"
            }))]),
            no_jitter_settings(),
        );

        let mut rx = fx.queue.subscribe(TOPIC_INGESTION).await.unwrap();
        let report = fx
            .worker
            .run_ingestion("crm.list_leads", "acme", json!({}), false)
            .await
            .unwrap();
        assert_eq!(report.items_processed, 2);
        assert_eq!(report.cursor.as_deref(), Some("page-2"));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.key, "acme:lead-1");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.key, "acme:lead-2");

        match fx.checkpoints.get("crm.list_leads").await.unwrap() {
            Some(Checkpoint::Cursor { cursor, .. }) => assert_eq!(cursor, "page-2"),
            other => panic!("expected cursor checkpoint, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn incremental_sync_passes_stored_cursor() {
        let fx = fixture(
            ScriptedTools::new(vec![Ok(json!({"items": []}))]),
            no_jitter_settings(),
        );
        fx.checkpoints
            .put("crm.list_leads", Checkpoint::cursor("page-7"))
            .await
            .unwrap();

        fx.worker
            .run_ingestion("crm.list_leads", "acme", json!({}), true)
            .await
            .unwrap();

        let params = fx.tools.call_params();
        assert_eq!(params[0]["cursor"], "page-7");
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_retry_with_exponential_backoff_then_dead_letter() {
        let fx = fixture(
            ScriptedTools::new(vec![
                Err(timeout_err()),
                Err(timeout_err()),
                Err(timeout_err()),
                Err(timeout_err()),
            ]),
            no_jitter_settings(),
        );
        let mut dlq = fx.queue.subscribe(TOPIC_INGESTION_DLQ).await.unwrap();

        let started = Instant::now();
        let err = fx
            .worker
            .run_ingestion("crm.list_leads", "acme", json!({}), false)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Timeout(_)));

        // Attempts at t=0, 1s, 3s, 7s (delays 1, 2, 4).
        let instants = fx.tools.call_instants();
        assert_eq!(instants.len(), 4);
        let offsets: Vec<u64> = instants
            .iter()
            .map(|t| t.duration_since(started).as_secs())
            .collect();
        assert_eq!(offsets, vec![0, 1, 3, 7]);

        let record = dlq.recv().await.unwrap();
        assert_eq!(record.key, "acme:crm.list_leads");
        assert_eq!(record.value["retry_count"], 3);
        assert_eq!(record.value["error_kind"], "timeout");
        assert_eq!(record.value["tool_id"], "crm.list_leads");
    }

    #[tokio::test]
    async fn fatal_errors_skip_retry_and_dlq() {
        let fx = fixture(
            ScriptedTools::new(vec![Err(RagError::PermissionDenied("no".into()))]),
            no_jitter_settings(),
        );

        let err = fx
            .worker
            .run_ingestion("crm.list_leads", "acme", json!({}), false)
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::PermissionDenied(_)));
        assert_eq!(fx.tools.call_count(), 1);
        assert_eq!(fx.queue.backlog(TOPIC_INGESTION_DLQ).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_then_success_needs_no_dlq() {
        let fx = fixture(
            ScriptedTools::new(vec![
                Err(RagError::TransportClosed("gone".into())),
                Ok(json!({"items": [{"id": "a", "content": "x"}]})),
            ]),
            no_jitter_settings(),
        );

        let report = fx
            .worker
            .run_ingestion("crm.list_leads", "acme", json!({}), false)
            .await
            .unwrap();
        assert_eq!(report.items_processed, 1);
        assert_eq!(fx.tools.call_count(), 2);
        assert_eq!(fx.queue.backlog(TOPIC_INGESTION_DLQ).await, 0);
    }

    #[tokio::test]
    async fn process_event_enqueues_with_idempotency_key() {
        let fx = fixture(ScriptedTools::new(vec![]), no_jitter_settings());
        let mut rx = fx.queue.subscribe(TOPIC_INGESTION).await.unwrap();

        let document = fx
            .worker
            .process_event(
                "crm.push",
                &json!({"id": "evt-1", "content": "pushed"}),
                "acme",
            )
            .await
            .unwrap();
        assert_eq!(document.id, "acme:crm.push:evt-1");

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.key, "acme:evt-1");
    }

    #[tokio::test]
    async fn streaming_checkpoints_and_dead_letters_bad_events() {
        let events = vec![
            SubscriptionEvent {
                id: Some("evt-1".into()),
                event: None,
                data: json!({"id": "a", "content": "good"}),
            },
            SubscriptionEvent {
                id: Some("evt-2".into()),
                event: None,
                // Not an object: normalization rejects it.
                data: json!("malformed"),
            },
            SubscriptionEvent {
                id: Some("evt-3".into()),
                event: None,
                data: json!({"id": "b", "content": "also good"}),
            },
        ];
        let fx = fixture(ScriptedTools::with_events(events), no_jitter_settings());
        let mut dlq = fx.queue.subscribe(TOPIC_INGESTION_DLQ).await.unwrap();

        let processed = fx
            .worker
            .start_streaming_ingestion(
                "feed.events",
                "acme",
                json!({}),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(processed, 2);

        match fx.checkpoints.get("feed.events").await.unwrap() {
            Some(Checkpoint::Stream { last_event_id, .. }) => assert_eq!(last_event_id, "evt-3"),
            other => panic!("expected stream checkpoint, got {other:?}"),
        }

        let record = dlq.recv().await.unwrap();
        assert_eq!(record.value["event_id"], "evt-2");
        assert_eq!(record.value["error_kind"], "schema_invalid");
        assert_eq!(fx.queue.backlog(TOPIC_INGESTION).await, 2);
    }

    #[tokio::test]
    async fn cancelled_stream_flushes_checkpoint_and_exits() {
        let fx = fixture(ScriptedTools::with_events(Vec::new()), no_jitter_settings());
        let cancel = CancellationToken::new();
        cancel.cancel();

        // An already-cancelled token must still exit cleanly even though the
        // (empty) stream would also end on its own.
        let processed = fx
            .worker
            .start_streaming_ingestion("feed.events", "acme", json!({}), cancel)
            .await
            .unwrap();
        assert_eq!(processed, 0);
    }
}
