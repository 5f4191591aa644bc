//! HTTP transport: requests go to `POST /rpc`, subscriptions open
//! `POST /subscribe` and consume `text/event-stream` frames, tracking
//! `last-event-id` for resumption.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use common::error::RagError;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{expect_success, EventStream, SubscriptionEvent, Transport};
use crate::jsonrpc::{Message, Request};

/// One parsed server-sent event before JSON decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSseEvent {
    pub id: Option<String>,
    pub event: Option<String>,
    pub data: String,
}

/// Incremental parser for the SSE wire format: `id:`/`event:`/`data:`
/// lines, events delimited by blank lines, comments starting with `:`.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    data_lines: Vec<String>,
    id: Option<String>,
    event: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<RawSseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if !self.data_lines.is_empty() {
                    events.push(RawSseEvent {
                        id: self.id.clone(),
                        event: self.event.take(),
                        data: self.data_lines.join("\n"),
                    });
                    self.data_lines.clear();
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }

            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "id" => self.id = Some(value.to_owned()),
                "event" => self.event = Some(value.to_owned()),
                "data" => self.data_lines.push(value.to_owned()),
                _ => {}
            }
        }

        events
    }
}

pub struct HttpSseTransport {
    base_url: String,
    client: reqwest::Client,
    next_id: AtomicU64,
    timeout: Duration,
    closed: AtomicBool,
}

impl HttpSseTransport {
    pub fn new(
        base_url: impl Into<String>,
        auth_headers: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Self, RagError> {
        let mut headers = HeaderMap::new();
        for (name, value) in auth_headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| RagError::Config(format!("invalid auth header name: {e}")))?;
            let value = HeaderValue::try_from(value.as_str())
                .map_err(|e| RagError::Config(format!("invalid auth header value: {e}")))?;
            headers.insert(name, value);
        }
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| RagError::Config(e.to_string()))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            client,
            next_id: AtomicU64::new(0),
            timeout,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), RagError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RagError::TransportClosed("transport closed".into()));
        }
        Ok(())
    }

    fn map_request_error(&self, err: reqwest::Error) -> RagError {
        if err.is_timeout() {
            RagError::Timeout(self.timeout)
        } else if err.is_connect() {
            RagError::TransportClosed(err.to_string())
        } else {
            RagError::DependencyUnavailable(err.to_string())
        }
    }
}

#[async_trait]
impl Transport for HttpSseTransport {
    async fn initialize(&self) -> Result<(), RagError> {
        self.ensure_open()?;
        let result = self
            .invoke(
                "mcp.initialize",
                json!({"version": "1.0", "capabilities": ["tools", "resources", "prompts"]}),
            )
            .await?;
        expect_success("mcp.initialize", &result)
    }

    async fn invoke(&self, method: &str, params: Value) -> Result<Value, RagError> {
        self.ensure_open()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let request = Request::new(id, method, params);

        let response = self
            .client
            .post(format!("{}/rpc", self.base_url))
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_request_error(e))?;

        if !response.status().is_success() {
            return Err(RagError::DependencyUnavailable(format!(
                "rpc endpoint returned HTTP {}",
                response.status()
            )));
        }

        let message: Message = response
            .json()
            .await
            .map_err(|e| RagError::DependencyUnavailable(e.to_string()))?;
        match message.error {
            Some(body) => Err(body.into_error()),
            None => Ok(message.result.unwrap_or(Value::Null)),
        }
    }

    async fn subscribe(
        &self,
        resource: &str,
        params: Value,
        last_event_id: Option<String>,
    ) -> Result<EventStream, RagError> {
        self.ensure_open()?;
        let subscription_id = Uuid::new_v4().to_string();
        let body = json!({
            "resource": resource,
            "params": params,
            "subscription_id": subscription_id,
        });

        let mut request = self
            .client
            .post(format!("{}/subscribe", self.base_url))
            .header("Accept", "text/event-stream")
            .json(&body);
        if let Some(last) = &last_event_id {
            request = request.header("Last-Event-ID", last);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.map_request_error(e))?;
        if !response.status().is_success() {
            return Err(RagError::DependencyUnavailable(format!(
                "subscribe endpoint returned HTTP {}",
                response.status()
            )));
        }

        let resource = resource.to_owned();
        let stream = async_stream::stream! {
            let mut parser = SseParser::new();
            let mut bytes = response.bytes_stream();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        yield Err(RagError::TransportClosed(err.to_string()));
                        return;
                    }
                };
                let text = String::from_utf8_lossy(&chunk).into_owned();
                for raw in parser.push(&text) {
                    match serde_json::from_str::<Value>(&raw.data) {
                        Ok(data) => yield Ok(SubscriptionEvent {
                            id: raw.id,
                            event: raw.event,
                            data,
                        }),
                        Err(err) => {
                            warn!(%resource, error = %err, "invalid JSON in SSE event");
                        }
                    }
                }
            }
            debug!(%resource, "event stream ended by server");
        };
        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<(), RagError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // Best-effort shutdown notice; the session itself is stateless.
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let request = Request::new(id, "mcp.shutdown", json!({}));
        let _ = self
            .client
            .post(format!("{}/rpc", self.base_url))
            .timeout(Duration::from_secs(2))
            .json(&request)
            .send()
            .await;
        Ok(())
    }
}
