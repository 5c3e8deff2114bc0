//! WebSocket transport: JSON-RPC over persistent text frames.

use std::sync::Arc;

use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::{TransportError, TransportResult};
use crate::traits::{Transport, TransportKind, TransportState};

const RECEIVE_BUFFER: usize = 256;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Persistent WebSocket speaking JSON-RPC text frames.
pub struct WsTransport {
    url: String,
    auth_token: Option<String>,
    state: Arc<Mutex<TransportState>>,
    sink: TokioMutex<Option<WsSink>>,
    receiver: TokioMutex<Option<mpsc::Receiver<String>>>,
    reader_task: TokioMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WsTransport {
    /// Transport dialing `url` (`ws://` or `wss://`) on connect.
    pub fn new(url: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            url: url.into(),
            auth_token,
            state: Arc::new(Mutex::new(TransportState::Disconnected)),
            sink: TokioMutex::new(None),
            receiver: TokioMutex::new(None),
            reader_task: TokioMutex::new(None),
        }
    }

    fn set_state(&self, state: TransportState) {
        *self.state.lock() = state;
    }
}

#[async_trait::async_trait]
impl Transport for WsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Websocket
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }

    fn state(&self) -> TransportState {
        self.state.lock().clone()
    }

    async fn connect(&self) -> TransportResult<()> {
        if matches!(self.state(), TransportState::Connected) {
            return Ok(());
        }
        self.set_state(TransportState::Connecting);

        let mut request = self.url.as_str().into_client_request().map_err(|e| {
            let error = TransportError::ConnectionFailed(format!("bad URL '{}': {e}", self.url));
            self.set_state(TransportState::Failed { reason: error.to_string() });
            error
        })?;
        if let Some(token) = &self.auth_token {
            let value = format!("Bearer {token}").parse().map_err(|_| {
                TransportError::ConnectionFailed("auth token is not a valid header".to_owned())
            })?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _) = connect_async(request).await.map_err(|e| {
            let error =
                TransportError::ConnectionFailed(format!("failed to dial {}: {e}", self.url));
            self.set_state(TransportState::Failed { reason: error.to_string() });
            error
        })?;

        let (sink, mut stream) = stream.split();
        *self.sink.lock().await = Some(sink);

        let (tx, rx) = mpsc::channel(RECEIVE_BUFFER);
        *self.receiver.lock().await = Some(rx);

        let url = self.url.clone();
        let state = self.state.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(result) = stream.next().await {
                match result {
                    Ok(Message::Text(text)) => {
                        if tx.send(text.to_string()).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!(url = %url, "websocket closed by peer");
                        break;
                    }
                    // Ping/pong is answered by the stream internals.
                    Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
                    Ok(Message::Binary(_)) => {
                        warn!(url = %url, "binary frame dropped; MCP uses text frames");
                    }
                    Err(e) => {
                        warn!(url = %url, error = %e, "websocket read error");
                        *state.lock() = TransportState::Failed { reason: e.to_string() };
                        break;
                    }
                }
            }
            let mut state = state.lock();
            if matches!(*state, TransportState::Connected | TransportState::Connecting) {
                *state = TransportState::Failed { reason: "stream ended".to_owned() };
            }
            drop(state);
            debug!(url = %url, "websocket reader finished");
        });
        *self.reader_task.lock().await = Some(reader_task);

        self.set_state(TransportState::Connected);
        debug!(url = %self.url, "websocket transport connected");
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        }
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
        *self.receiver.lock().await = None;
        self.set_state(TransportState::Disconnected);
        Ok(())
    }

    async fn send(&self, frame: String) -> TransportResult<()> {
        let mut sink = self.sink.lock().await;
        let sink = sink.as_mut().ok_or(TransportError::NotConnected)?;
        sink.send(Message::Text(frame.into()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn receive(&self) -> TransportResult<Option<String>> {
        let mut receiver = self.receiver.lock().await;
        let receiver = receiver.as_mut().ok_or(TransportError::NotConnected)?;
        Ok(receiver.recv().await)
    }
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("url", &self.url)
            .field("state", &self.state())
            .finish()
    }
}
