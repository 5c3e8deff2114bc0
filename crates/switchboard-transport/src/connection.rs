//! Per-server MCP connection with request/response correlation.
//!
//! A [`ServerConnection`] owns one [`Transport`] and is the transport's
//! single receive consumer: a background reader task drains every inbound
//! frame and routes responses to the oneshot waiter registered under the
//! request id. Callers multiplex freely; concurrent `tools/call`
//! invocations are bounded by a per-server semaphore and each carries its
//! own deadline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex as TokioMutex, Semaphore};
use tracing::{debug, trace, warn};

use switchboard_protocol::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, JsonRpcMessage,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, JsonRpcVersion, RequestId, ServerInfo,
    ToolSpec, ToolsListResult, METHOD_CALL_TOOL, METHOD_INITIALIZE, METHOD_LIST_TOOLS,
};

use crate::error::{InvokeError, TransportError};
use crate::traits::{Transport, TransportState};

type PendingMap = Mutex<HashMap<String, oneshot::Sender<JsonRpcResponse>>>;

/// Connection tuning.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server id, used for logs and canonical names.
    pub server_id: String,
    /// Max concurrent calls multiplexed onto the transport.
    pub max_inflight: usize,
    /// Timeout for `initialize` and `tools/list` during the handshake.
    pub handshake_timeout: Duration,
    /// Name advertised in the handshake.
    pub client_name: String,
}

impl ConnectionConfig {
    /// Config with defaults for everything but the id.
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            max_inflight: 8,
            handshake_timeout: Duration::from_secs(10),
            client_name: "switchboard".to_owned(),
        }
    }
}

/// One correlated MCP connection.
pub struct ServerConnection {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    pending: Arc<PendingMap>,
    next_id: AtomicI64,
    inflight: Arc<Semaphore>,
    reader_alive: Arc<AtomicBool>,
    reader_task: TokioMutex<Option<tokio::task::JoinHandle<()>>>,
    server_info: Mutex<Option<ServerInfo>>,
}

impl ServerConnection {
    /// Wrap `transport` with correlation state.
    pub fn new(config: ConnectionConfig, transport: Arc<dyn Transport>) -> Self {
        let inflight = Arc::new(Semaphore::new(config.max_inflight.max(1)));
        Self {
            config,
            transport,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicI64::new(1),
            inflight,
            reader_alive: Arc::new(AtomicBool::new(false)),
            reader_task: TokioMutex::new(None),
            server_info: Mutex::new(None),
        }
    }

    /// Server id this connection serves.
    pub fn server_id(&self) -> &str {
        &self.config.server_id
    }

    /// Underlying transport state.
    pub fn transport_state(&self) -> TransportState {
        self.transport.state()
    }

    /// Endpoint description for status surfaces.
    pub fn endpoint(&self) -> String {
        self.transport.endpoint()
    }

    /// Identity the server reported during the handshake.
    pub fn server_info(&self) -> Option<ServerInfo> {
        self.server_info.lock().clone()
    }

    /// Whether the reader is still draining frames.
    pub fn is_alive(&self) -> bool {
        self.reader_alive.load(Ordering::Acquire)
    }

    /// Connect, run the handshake, and return the server's tool list.
    ///
    /// Reconnects from a failed transport: the dead connection is torn
    /// down first, then dialed (or respawned) fresh.
    pub async fn connect_and_handshake(&self) -> Result<Vec<ToolSpec>, InvokeError> {
        if matches!(self.transport.state(), TransportState::Failed { .. }) {
            let _ = self.transport.disconnect().await;
        }
        self.transport.connect().await.map_err(InvokeError::from)?;
        self.spawn_reader().await;

        let params = serde_json::to_value(InitializeParams::for_client(&self.config.client_name))
            .map_err(|e| InvokeError::Protocol(e.to_string()))?;
        let init: InitializeResult = self
            .request_typed(METHOD_INITIALIZE, Some(params), self.config.handshake_timeout)
            .await?;
        debug!(
            server = %self.config.server_id,
            name = %init.server_info.name,
            version = %init.server_info.version,
            "handshake complete"
        );
        *self.server_info.lock() = Some(init.server_info);

        // Per protocol, the client confirms before issuing requests.
        self.notify("notifications/initialized", None).await?;

        let tools: ToolsListResult = self
            .request_typed(METHOD_LIST_TOOLS, None, self.config.handshake_timeout)
            .await?;
        Ok(tools.tools)
    }

    /// Invoke one tool with a per-call deadline.
    ///
    /// Waiting for a semaphore permit counts against the deadline. A
    /// JSON-RPC error object on `tools/call` is the server's structured
    /// tool failure and maps to [`InvokeError::ToolError`], as does a
    /// result carrying `is_error`.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: Value,
        deadline: Duration,
    ) -> Result<CallToolResult, InvokeError> {
        let started = Instant::now();
        let permit = tokio::time::timeout(deadline, self.inflight.clone().acquire_owned())
            .await
            .map_err(|_| InvokeError::Timeout)?
            .map_err(|_| InvokeError::Unreachable("connection closed".to_owned()))?;

        let remaining = deadline.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(InvokeError::Timeout);
        }

        let params = serde_json::to_value(CallToolParams {
            name: tool.to_owned(),
            arguments,
        })
        .map_err(|e| InvokeError::Protocol(e.to_string()))?;

        let response = self.request(METHOD_CALL_TOOL, Some(params), remaining).await;
        drop(permit);

        match response?.into_result() {
            Ok(value) => serde_json::from_value::<CallToolResult>(value)
                .map_err(|e| InvokeError::Protocol(format!("malformed tool result: {e}"))),
            Err(rpc_error) => Err(InvokeError::ToolError(rpc_error.message)),
        }
    }

    /// Issue one request and wait for its correlated response.
    ///
    /// `timeout` covers the whole exchange; on the HTTP transport the send
    /// itself is the round-trip, so it counts too.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, InvokeError> {
        let started = Instant::now();
        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::Relaxed));
        let key = id.as_key();

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(key.clone(), tx);

        let request = JsonRpcRequest::new(id, method, params);
        let frame = match serde_json::to_string(&request) {
            Ok(frame) => frame,
            Err(e) => {
                self.pending.lock().remove(&key);
                return Err(InvokeError::Protocol(e.to_string()));
            }
        };

        match tokio::time::timeout(timeout, self.transport.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.pending.lock().remove(&key);
                return Err(classify_send_error(e));
            }
            Err(_) => {
                self.pending.lock().remove(&key);
                return Err(InvokeError::Timeout);
            }
        }

        let remaining = timeout.saturating_sub(started.elapsed());
        match tokio::time::timeout(remaining, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(InvokeError::Unreachable("connection closed mid-call".to_owned())),
            Err(_) => {
                self.pending.lock().remove(&key);
                Err(InvokeError::Timeout)
            }
        }
    }

    /// Send a notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), InvokeError> {
        let notification = JsonRpcNotification {
            jsonrpc: JsonRpcVersion,
            method: method.to_owned(),
            params,
        };
        let frame =
            serde_json::to_string(&notification).map_err(|e| InvokeError::Protocol(e.to_string()))?;
        self.transport.send(frame).await.map_err(classify_send_error)
    }

    /// Tear the connection down. Pending calls complete with
    /// `Unreachable`; the transport closes cooperatively.
    pub async fn shutdown(&self) {
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        self.reader_alive.store(false, Ordering::Release);
        self.pending.lock().clear();
        if let Err(e) = self.transport.disconnect().await {
            warn!(server = %self.config.server_id, error = %e, "disconnect failed");
        }
    }

    async fn request_typed<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<T, InvokeError> {
        let response = self.request(method, params, timeout).await?;
        let value = response
            .into_result()
            .map_err(|e| InvokeError::Protocol(format!("{method} failed: {e}")))?;
        serde_json::from_value(value)
            .map_err(|e| InvokeError::Protocol(format!("malformed {method} result: {e}")))
    }

    async fn spawn_reader(&self) {
        let mut slot = self.reader_task.lock().await;
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let transport = self.transport.clone();
        let pending = self.pending.clone();
        let alive = self.reader_alive.clone();
        let server_id = self.config.server_id.clone();
        alive.store(true, Ordering::Release);

        let task = tokio::spawn(async move {
            loop {
                match transport.receive().await {
                    Ok(Some(frame)) => route_frame(&server_id, &frame, &pending),
                    Ok(None) => {
                        debug!(server = %server_id, "transport reached end of stream");
                        break;
                    }
                    Err(e) => {
                        warn!(server = %server_id, error = %e, "transport receive failed");
                        break;
                    }
                }
            }
            alive.store(false, Ordering::Release);
            // Dropping the senders completes every waiter with closed-channel,
            // which callers surface as Unreachable.
            pending.lock().clear();
        });
        *slot = Some(task);
    }
}

fn classify_send_error(error: TransportError) -> InvokeError {
    match error {
        TransportError::Serialization(msg) => InvokeError::Protocol(msg),
        other => InvokeError::Unreachable(other.to_string()),
    }
}

fn route_frame(server_id: &str, frame: &str, pending: &PendingMap) {
    match serde_json::from_str::<JsonRpcMessage>(frame) {
        Ok(JsonRpcMessage::Response(response)) => {
            let Some(request_id) = response.id.0.clone() else {
                warn!(server = %server_id, "response with null id dropped");
                return;
            };
            let key = request_id.as_key();
            match pending.lock().remove(&key) {
                Some(waiter) => {
                    trace!(server = %server_id, id = %key, "response correlated");
                    // A dropped receiver means the caller timed out; fine.
                    let _ = waiter.send(response);
                }
                None => {
                    warn!(server = %server_id, id = %key, "response for unknown request");
                }
            }
        }
        Ok(JsonRpcMessage::Request(request)) => {
            // Server-initiated requests are out of contract for tool servers.
            debug!(server = %server_id, method = %request.method, "server request ignored");
        }
        Ok(JsonRpcMessage::Notification(notification)) => {
            trace!(server = %server_id, method = %notification.method, "notification");
        }
        Err(e) => {
            warn!(server = %server_id, error = %e, "unparseable frame dropped");
        }
    }
}

impl std::fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConnection")
            .field("server_id", &self.config.server_id)
            .field("endpoint", &self.transport.endpoint())
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}
