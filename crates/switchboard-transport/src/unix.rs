//! Unix domain socket transport: length-prefixed JSON-RPC.
//!
//! Frames are u32-length-prefixed JSON payloads over a persistent stream
//! socket. On disconnect the supervising connection redials with backoff.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use parking_lot::Mutex;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::error::{TransportError, TransportResult};
use crate::traits::{Transport, TransportKind, TransportState};

const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;
const RECEIVE_BUFFER: usize = 256;

type FrameSink = SplitSink<Framed<UnixStream, LengthDelimitedCodec>, Bytes>;

/// Length-prefixed JSON over a Unix domain socket.
pub struct UnixTransport {
    path: PathBuf,
    state: Arc<Mutex<TransportState>>,
    sink: TokioMutex<Option<FrameSink>>,
    receiver: TokioMutex<Option<mpsc::Receiver<String>>>,
    reader_task: TokioMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl UnixTransport {
    /// Transport dialing `path` on connect.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Arc::new(Mutex::new(TransportState::Disconnected)),
            sink: TokioMutex::new(None),
            receiver: TokioMutex::new(None),
            reader_task: TokioMutex::new(None),
        }
    }

    fn codec() -> LengthDelimitedCodec {
        LengthDelimitedCodec::builder()
            .max_frame_length(MAX_FRAME_BYTES)
            .new_codec()
    }

    fn set_state(&self, state: TransportState) {
        *self.state.lock() = state;
    }
}

#[async_trait::async_trait]
impl Transport for UnixTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Unix
    }

    fn endpoint(&self) -> String {
        format!("unix://{}", self.path.display())
    }

    fn state(&self) -> TransportState {
        self.state.lock().clone()
    }

    async fn connect(&self) -> TransportResult<()> {
        if matches!(self.state(), TransportState::Connected) {
            return Ok(());
        }
        self.set_state(TransportState::Connecting);

        let stream = UnixStream::connect(&self.path).await.map_err(|e| {
            let error = TransportError::ConnectionFailed(format!(
                "failed to connect to {}: {e}",
                self.path.display()
            ));
            self.set_state(TransportState::Failed { reason: error.to_string() });
            error
        })?;

        let framed = Framed::new(stream, Self::codec());
        let (sink, mut stream) = framed.split();
        *self.sink.lock().await = Some(sink);

        let (tx, rx) = mpsc::channel(RECEIVE_BUFFER);
        *self.receiver.lock().await = Some(rx);

        let path = self.path.clone();
        let state = self.state.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(result) = stream.next().await {
                match result {
                    Ok(frame) => match String::from_utf8(frame.to_vec()) {
                        Ok(text) => {
                            if tx.send(text).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(path = %path.display(), error = %e, "non-UTF-8 frame dropped");
                        }
                    },
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "unix socket read error");
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
            debug!(path = %path.display(), "unix reader finished");
        });
        *self.reader_task.lock().await = Some(reader_task);

        self.set_state(TransportState::Connected);
        debug!(path = %self.path.display(), "unix transport connected");
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        if let Some(mut sink) = self.sink.lock().await.take() {
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
        sink.send(Bytes::from(frame))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn receive(&self) -> TransportResult<Option<String>> {
        let mut receiver = self.receiver.lock().await;
        let receiver = receiver.as_mut().ok_or(TransportError::NotConnected)?;
        Ok(receiver.recv().await)
    }
}

impl std::fmt::Debug for UnixTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnixTransport")
            .field("path", &self.path)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::net::UnixListener;

    /// Echo server accepting one connection, bouncing frames back.
    async fn spawn_echo_server(path: &std::path::Path) {
        let listener = UnixListener::bind(path).unwrap();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                let mut framed = Framed::new(stream, UnixTransport::codec());
                while let Some(Ok(frame)) = framed.next().await {
                    if framed.send(frame.freeze()).await.is_err() {
                        break;
                    }
                }
            }
        });
    }

    #[tokio::test]
    async fn frames_round_trip_with_length_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.sock");
        spawn_echo_server(&path).await;

        let transport = UnixTransport::new(&path);
        transport.connect().await.unwrap();

        let frame = r#"{"jsonrpc":"2.0","id":7,"method":"tools/list"}"#.to_owned();
        transport.send(frame.clone()).await.unwrap();
        assert_eq!(transport.receive().await.unwrap(), Some(frame));

        transport.disconnect().await.unwrap();
        assert_eq!(transport.state(), TransportState::Disconnected);
    }

    #[tokio::test]
    async fn missing_socket_fails_to_connect() {
        let transport = UnixTransport::new("/tmp/switchboard-does-not-exist.sock");
        let result = transport.connect().await;
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
        assert!(matches!(transport.state(), TransportState::Failed { .. }));
    }

    #[tokio::test]
    async fn peer_close_surfaces_as_end_of_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mcp.sock");
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            // Accept and immediately drop the connection.
            let _ = listener.accept().await;
        });

        let transport = UnixTransport::new(&path);
        transport.connect().await.unwrap();
        assert_eq!(transport.receive().await.unwrap(), None);
    }
}
