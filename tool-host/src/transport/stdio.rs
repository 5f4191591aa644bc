//! Stdio transport: the adapter runs as a child process and speaks
//! newline-delimited JSON-RPC 2.0 on stdin/stdout. A background read loop
//! correlates replies to pending requests by `id` and routes `mcp.event`
//! notifications to subscription channels.

use std::{
    collections::HashMap,
    process::Stdio,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use common::error::RagError;
use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::{mpsc, oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{expect_success, EventStream, SubscriptionEvent, Transport};
use crate::jsonrpc::{Message, Request};

const EVENT_BUFFER: usize = 256;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

type PendingMap = Arc<StdMutex<HashMap<u64, oneshot::Sender<Result<Value, RagError>>>>>;
type SubscriptionMap = Arc<StdMutex<HashMap<String, mpsc::Sender<SubscriptionEvent>>>>;
type SharedWriter = Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>;

#[derive(Clone)]
struct ConnectionHandle {
    writer: SharedWriter,
    pending: PendingMap,
    subscriptions: SubscriptionMap,
    next_id: Arc<AtomicU64>,
    timeout: Duration,
}

/// Removes the pending slot when an invoke future is abandoned before its
/// reply arrives, leaving the transport healthy for later requests.
struct PendingSlot {
    pending: PendingMap,
    id: u64,
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        if let Ok(mut map) = self.pending.lock() {
            map.remove(&self.id);
        }
    }
}

impl ConnectionHandle {
    async fn invoke(&self, method: &str, params: Value) -> Result<Value, RagError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| RagError::Internal("pending map poisoned".into()))?
            .insert(id, tx);
        let _slot = PendingSlot {
            pending: Arc::clone(&self.pending),
            id,
        };

        let mut frame = serde_json::to_string(&Request::new(id, method, params))?;
        frame.push('\n');
        {
            let mut writer = self.writer.lock().await;
            writer
                .write_all(frame.as_bytes())
                .await
                .map_err(|e| RagError::TransportClosed(e.to_string()))?;
            writer
                .flush()
                .await
                .map_err(|e| RagError::TransportClosed(e.to_string()))?;
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Err(_) => Err(RagError::Timeout(self.timeout)),
            Ok(Err(_)) => Err(RagError::TransportClosed(
                "connection lost before reply".into(),
            )),
            Ok(Ok(outcome)) => outcome,
        }
    }

    fn register_subscription(&self, subscription_id: &str) -> Result<mpsc::Receiver<SubscriptionEvent>, RagError> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        self.subscriptions
            .lock()
            .map_err(|_| RagError::Internal("subscription map poisoned".into()))?
            .insert(subscription_id.to_owned(), tx);
        Ok(rx)
    }

    fn remove_subscription(&self, subscription_id: &str) {
        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.remove(subscription_id);
        }
    }
}

fn fail_pending(pending: &PendingMap, reason: &str) {
    if let Ok(mut map) = pending.lock() {
        for (_, sender) in map.drain() {
            let _ = sender.send(Err(RagError::TransportClosed(reason.to_owned())));
        }
    }
}

async fn dispatch(message: Message, pending: &PendingMap, subscriptions: &SubscriptionMap) {
    if let Some(id) = message.response_id() {
        let sender = pending.lock().ok().and_then(|mut map| map.remove(&id));
        if let Some(sender) = sender {
            let outcome = match message.error {
                Some(body) => Err(body.into_error()),
                None => Ok(message.result.unwrap_or(Value::Null)),
            };
            let _ = sender.send(outcome);
        } else {
            debug!(id, "reply for unknown or abandoned request");
        }
        return;
    }

    if message.method.as_deref() == Some("mcp.event") {
        let params = message.params.unwrap_or(Value::Null);
        let Some(subscription_id) = params.get("subscription_id").and_then(Value::as_str) else {
            warn!("mcp.event without subscription_id");
            return;
        };
        let sender = subscriptions
            .lock()
            .ok()
            .and_then(|map| map.get(subscription_id).cloned());
        if let Some(sender) = sender {
            let event = SubscriptionEvent {
                id: params.get("id").and_then(Value::as_str).map(str::to_owned),
                event: params
                    .get("event")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
                data: params.get("data").cloned().unwrap_or(Value::Null),
            };
            let _ = sender.send(event).await;
        }
        return;
    }

    if let Some(method) = message.method {
        debug!(%method, "notification ignored");
    }
}

async fn read_loop<R>(reader: R, pending: PendingMap, subscriptions: SubscriptionMap)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<Message>(line) {
                    Ok(message) => dispatch(message, &pending, &subscriptions).await,
                    Err(err) => warn!(error = %err, "discarding unparseable frame"),
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "adapter read failed");
                break;
            }
        }
    }
    fail_pending(&pending, "adapter stream ended");
    if let Ok(mut subs) = subscriptions.lock() {
        subs.clear();
    }
    debug!("read loop terminated");
}

struct Connection {
    handle: ConnectionHandle,
    reader_task: JoinHandle<()>,
    child: Option<Child>,
}

impl Connection {
    fn spawn<R, W>(reader: R, writer: W, timeout: Duration, child: Option<Child>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let subscriptions: SubscriptionMap = Arc::new(StdMutex::new(HashMap::new()));
        let reader_task = tokio::spawn(read_loop(
            reader,
            Arc::clone(&pending),
            Arc::clone(&subscriptions),
        ));
        Self {
            handle: ConnectionHandle {
                writer: Arc::new(Mutex::new(Box::new(writer))),
                pending,
                subscriptions,
                next_id: Arc::new(AtomicU64::new(0)),
                timeout,
            },
            reader_task,
            child,
        }
    }
}

/// Unsubscribes (best effort) when the event stream is dropped.
struct SubscriptionGuard {
    handle: ConnectionHandle,
    subscription_id: String,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.handle.remove_subscription(&self.subscription_id);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let handle = self.handle.clone();
            let subscription_id = std::mem::take(&mut self.subscription_id);
            runtime.spawn(async move {
                let _ = handle
                    .invoke("mcp.unsubscribe", json!({"subscription_id": subscription_id}))
                    .await;
            });
        }
    }
}

pub struct StdioTransport {
    command: String,
    env: HashMap<String, String>,
    timeout: Duration,
    state: Mutex<Option<Connection>>,
}

impl StdioTransport {
    pub fn new(
        command: impl Into<String>,
        env: HashMap<String, String>,
        timeout: Duration,
    ) -> Self {
        Self {
            command: command.into(),
            env,
            timeout,
            state: Mutex::new(None),
        }
    }

    async fn handle(&self) -> Result<ConnectionHandle, RagError> {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|c| c.handle.clone())
            .ok_or_else(|| RagError::TransportClosed("transport not initialized".into()))
    }

    async fn handshake(&self, connection: Connection) -> Result<(), RagError> {
        let handle = connection.handle.clone();
        *self.state.lock().await = Some(connection);
        let result = handle
            .invoke(
                "mcp.initialize",
                json!({"version": "1.0", "capabilities": ["tools", "resources", "prompts"]}),
            )
            .await?;
        expect_success("mcp.initialize", &result)
    }

    /// Wires the transport over arbitrary streams instead of a child
    /// process. Used by tests over an in-memory duplex.
    #[cfg(test)]
    async fn initialize_with<R, W>(&self, reader: R, writer: W) -> Result<(), RagError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let connection = Connection::spawn(reader, writer, self.timeout, None);
        self.handshake(connection).await
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn initialize(&self) -> Result<(), RagError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RagError::TransportClosed(format!("failed to spawn adapter: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RagError::TransportClosed("adapter stdout unavailable".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RagError::TransportClosed("adapter stdin unavailable".into()))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "tool_host::adapter", "{line}");
                }
            });
        }

        let connection = Connection::spawn(stdout, stdin, self.timeout, Some(child));
        self.handshake(connection).await
    }

    async fn invoke(&self, method: &str, params: Value) -> Result<Value, RagError> {
        self.handle().await?.invoke(method, params).await
    }

    async fn subscribe(
        &self,
        resource: &str,
        params: Value,
        last_event_id: Option<String>,
    ) -> Result<EventStream, RagError> {
        let handle = self.handle().await?;
        let subscription_id = Uuid::new_v4().to_string();
        let mut rx = handle.register_subscription(&subscription_id)?;

        let mut request = json!({
            "resource": resource,
            "params": params,
            "subscription_id": subscription_id,
        });
        if let Some(last) = last_event_id {
            request["last_event_id"] = Value::String(last);
        }

        let result = match handle.invoke("mcp.subscribe", request).await {
            Ok(result) => result,
            Err(err) => {
                handle.remove_subscription(&subscription_id);
                return Err(err);
            }
        };
        if let Err(err) = expect_success("mcp.subscribe", &result) {
            handle.remove_subscription(&subscription_id);
            return Err(err);
        }

        let guard = SubscriptionGuard {
            handle,
            subscription_id,
        };
        let stream = async_stream::stream! {
            let _guard = guard;
            while let Some(event) = rx.recv().await {
                yield Ok(event);
            }
        };
        Ok(Box::pin(stream))
    }

    async fn close(&self) -> Result<(), RagError> {
        let Some(connection) = self.state.lock().await.take() else {
            return Ok(());
        };

        let shutdown = connection.handle.invoke("mcp.shutdown", json!({}));
        if tokio::time::timeout(SHUTDOWN_GRACE, shutdown).await.is_err() {
            debug!("mcp.shutdown did not complete before teardown");
        }

        connection.reader_task.abort();
        if let Some(mut child) = connection.child {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        fail_pending(&connection.handle.pending, "transport closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::io::{duplex, split, AsyncWriteExt, ReadHalf, WriteHalf};

    type ServerReader = BufReader<ReadHalf<tokio::io::DuplexStream>>;
    type ServerWriter = WriteHalf<tokio::io::DuplexStream>;

    async fn respond(writer: &mut ServerWriter, body: Value) {
        let mut line = body.to_string();
        line.push('\n');
        writer.write_all(line.as_bytes()).await.unwrap();
        writer.flush().await.unwrap();
    }

    /// Scripted adapter: answers the handshake, then serves a small method
    /// table including a subscription that emits two events.
    fn spawn_adapter(stream: tokio::io::DuplexStream) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let (read, mut write) = split(stream);
            let mut lines: ServerReader = BufReader::new(read);
            let mut buf = String::new();
            loop {
                buf.clear();
                let n = tokio::io::AsyncBufReadExt::read_line(&mut lines, &mut buf).await;
                match n {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                let request: Value = match serde_json::from_str(buf.trim()) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                let id = request["id"].clone();
                match request["method"].as_str().unwrap_or_default() {
                    "mcp.initialize" | "mcp.unsubscribe" | "mcp.shutdown" => {
                        respond(
                            &mut write,
                            json!({"jsonrpc": "2.0", "id": id, "result": {"status": "success"}}),
                        )
                        .await;
                    }
                    "mcp.ping" => {
                        respond(
                            &mut write,
                            json!({"jsonrpc": "2.0", "id": id, "result": {"status": "success", "pong": true}}),
                        )
                        .await;
                    }
                    "slow.call" => {
                        // Never replies; exercises the timeout path.
                    }
                    "busy.call" => {
                        respond(
                            &mut write,
                            json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32000, "message": "busy"}}),
                        )
                        .await;
                    }
                    "mcp.subscribe" => {
                        let subscription_id = request["params"]["subscription_id"]
                            .as_str()
                            .unwrap()
                            .to_owned();
                        respond(
                            &mut write,
                            json!({"jsonrpc": "2.0", "id": id, "result": {"status": "success"}}),
                        )
                        .await;
                        for n in 1..=2 {
                            respond(
                                &mut write,
                                json!({
                                    "jsonrpc": "2.0",
                                    "method": "mcp.event",
                                    "params": {
                                        "subscription_id": subscription_id,
                                        "id": format!("evt-{n}"),
                                        "data": {"n": n}
                                    }
                                }),
                            )
                            .await;
                        }
                    }
                    other => {
                        respond(
                            &mut write,
                            json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32601, "message": format!("unknown method {other}")}}),
                        )
                        .await;
                    }
                }
            }
        })
    }

    async fn connected_transport(
        timeout: Duration,
    ) -> (StdioTransport, tokio::task::JoinHandle<()>) {
        let (client_io, server_io) = duplex(16 * 1024);
        let adapter = spawn_adapter(server_io);
        let (read, write) = split(client_io);
        let transport = StdioTransport::new("unused", HashMap::new(), timeout);
        transport.initialize_with(read, write).await.unwrap();
        (transport, adapter)
    }

    #[tokio::test]
    async fn invoke_correlates_replies_by_id() {
        let (transport, _adapter) = connected_transport(Duration::from_secs(5)).await;
        let result = transport.invoke("mcp.ping", json!({})).await.unwrap();
        assert_eq!(result["pong"], true);
    }

    #[tokio::test]
    async fn rpc_errors_surface_with_code() {
        let (transport, _adapter) = connected_transport(Duration::from_secs(5)).await;
        let err = transport.invoke("busy.call", json!({})).await.unwrap_err();
        match err {
            RagError::Rpc { code, retryable, .. } => {
                assert_eq!(code, -32000);
                assert!(retryable);
            }
            other => panic!("expected rpc error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn missing_reply_times_out() {
        let (transport, _adapter) = connected_transport(Duration::from_secs(30)).await;
        let err = transport.invoke("slow.call", json!({})).await.unwrap_err();
        assert!(matches!(err, RagError::Timeout(_)));

        // The transport stays healthy for the next request.
        let result = transport.invoke("mcp.ping", json!({})).await.unwrap();
        assert_eq!(result["pong"], true);
    }

    #[tokio::test]
    async fn uninitialized_transport_reports_closed() {
        let transport = StdioTransport::new("unused", HashMap::new(), Duration::from_secs(1));
        let err = transport.invoke("mcp.ping", json!({})).await.unwrap_err();
        assert!(matches!(err, RagError::TransportClosed(_)));
    }

    #[tokio::test]
    async fn subscribe_routes_events_by_subscription_id() {
        let (transport, _adapter) = connected_transport(Duration::from_secs(5)).await;
        let mut stream = transport
            .subscribe("feed.changes", json!({}), None)
            .await
            .unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.id.as_deref(), Some("evt-1"));
        assert_eq!(first.data["n"], 1);
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.id.as_deref(), Some("evt-2"));
    }

    #[tokio::test]
    async fn adapter_exit_fails_pending_requests() {
        let (client_io, server_io) = duplex(16 * 1024);
        let (read, write) = split(client_io);
        let transport = StdioTransport::new("unused", HashMap::new(), Duration::from_secs(30));

        // Adapter that answers the handshake and then disconnects.
        let adapter = tokio::spawn(async move {
            let (server_read, mut server_write) = split(server_io);
            let mut lines = BufReader::new(server_read).lines();
            if let Ok(Some(line)) = lines.next_line().await {
                let request: Value = serde_json::from_str(line.trim()).unwrap();
                respond(
                    &mut server_write,
                    json!({"jsonrpc": "2.0", "id": request["id"], "result": {"status": "success"}}),
                )
                .await;
            }
            if let Ok(Some(_)) = lines.next_line().await {
                // Drop both halves without replying.
            }
        });

        transport.initialize_with(read, write).await.unwrap();
        let err = transport.invoke("mcp.ping", json!({})).await.unwrap_err();
        assert!(matches!(err, RagError::TransportClosed(_)));
        adapter.await.unwrap();
    }
}
