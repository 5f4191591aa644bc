pub mod http_sse;
pub mod stdio;

use std::pin::Pin;

use async_trait::async_trait;
use common::error::RagError;
use futures::Stream;
use serde_json::Value;

/// One event from a subscription stream. `id` feeds `last_event_id`
/// resumption.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: Value,
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<SubscriptionEvent, RagError>> + Send>>;

/// Carrier of JSON-RPC 2.0 requests to one tool adapter.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection and perform the `mcp.initialize` handshake.
    async fn initialize(&self) -> Result<(), RagError>;

    /// Invoke a method. Fails with `TransportClosed` when uninitialized,
    /// `Timeout` after the configured deadline, `Rpc` on a JSON-RPC error.
    async fn invoke(&self, method: &str, params: Value) -> Result<Value, RagError>;

    /// Open a subscription. The stream is finite only when the server
    /// closes it; `last_event_id` resumes a previous subscription.
    async fn subscribe(
        &self,
        resource: &str,
        params: Value,
        last_event_id: Option<String>,
    ) -> Result<EventStream, RagError>;

    /// Best-effort `mcp.shutdown`, then tear down. All pending requests
    /// fail with `TransportClosed`.
    async fn close(&self) -> Result<(), RagError>;
}

pub(crate) fn expect_success(method: &str, result: &Value) -> Result<(), RagError> {
    match result.get("status").and_then(Value::as_str) {
        Some("success") => Ok(()),
        other => Err(RagError::DependencyUnavailable(format!(
            "{method} rejected by adapter (status {other:?})"
        ))),
    }
}
