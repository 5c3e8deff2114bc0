//! HTTP transport: one JSON-RPC envelope per POST body.
//!
//! Stateless: there is no connection to keep alive, only a client and a
//! URL. Responses are queued internally so the transport still satisfies
//! the send/receive contract the correlating connection expects; a failed
//! POST surfaces on `send`, and health is probed with ordinary requests.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tracing::debug;

use crate::error::{TransportError, TransportResult};
use crate::traits::{Transport, TransportKind, TransportState};

const RECEIVE_BUFFER: usize = 256;

/// Stateless JSON-RPC over HTTP POST.
pub struct HttpTransport {
    url: String,
    auth_token: Option<String>,
    client: reqwest::Client,
    state: Arc<Mutex<TransportState>>,
    sender: TokioMutex<Option<mpsc::Sender<String>>>,
    receiver: TokioMutex<Option<mpsc::Receiver<String>>>,
}

impl HttpTransport {
    /// Transport POSTing envelopes to `url`.
    pub fn new(url: impl Into<String>, auth_token: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_default();
        Self {
            url: url.into(),
            auth_token,
            client,
            state: Arc::new(Mutex::new(TransportState::Disconnected)),
            sender: TokioMutex::new(None),
            receiver: TokioMutex::new(None),
        }
    }

    fn set_state(&self, state: TransportState) {
        *self.state.lock() = state;
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }

    fn state(&self) -> TransportState {
        self.state.lock().clone()
    }

    async fn connect(&self) -> TransportResult<()> {
        let (tx, rx) = mpsc::channel(RECEIVE_BUFFER);
        *self.sender.lock().await = Some(tx);
        *self.receiver.lock().await = Some(rx);
        self.set_state(TransportState::Connected);
        debug!(url = %self.url, "http transport ready");
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        *self.sender.lock().await = None;
        *self.receiver.lock().await = None;
        self.set_state(TransportState::Disconnected);
        Ok(())
    }

    async fn send(&self, frame: String) -> TransportResult<()> {
        if !matches!(self.state(), TransportState::Connected) {
            return Err(TransportError::NotConnected);
        }

        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(frame);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TransportError::SendFailed(format!("POST {} failed: {e}", self.url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::SendFailed(format!(
                "POST {} returned {status}",
                self.url
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| TransportError::ReceiveFailed(e.to_string()))?;

        // Notifications get 202/empty bodies; nothing to queue.
        if body.trim().is_empty() {
            return Ok(());
        }

        let sender = self.sender.lock().await;
        let sender = sender.as_ref().ok_or(TransportError::NotConnected)?;
        sender
            .send(body)
            .await
            .map_err(|_| TransportError::ReceiveFailed("response queue closed".to_owned()))
    }

    async fn receive(&self) -> TransportResult<Option<String>> {
        let mut receiver = self.receiver.lock().await;
        let receiver = receiver.as_mut().ok_or(TransportError::NotConnected)?;
        Ok(receiver.recv().await)
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("url", &self.url)
            .field("state", &self.state())
            .finish()
    }
}
