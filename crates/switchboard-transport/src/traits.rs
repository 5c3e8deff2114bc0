//! The transport contract.

use async_trait::async_trait;

use crate::error::TransportResult;

/// Which wire a transport speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Child process on stdin/stdout.
    Stdio,
    /// Persistent WebSocket.
    Websocket,
    /// Unix domain socket.
    Unix,
    /// Stateless HTTP.
    Http,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Stdio => "stdio",
            Self::Websocket => "websocket",
            Self::Unix => "unix",
            Self::Http => "http",
        };
        write!(f, "{name}")
    }
}

/// Connection state of a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportState {
    /// Not connected.
    Disconnected,
    /// Connection in progress.
    Connecting,
    /// Ready to move frames.
    Connected,
    /// Dead; `reason` says why.
    Failed {
        /// Failure description.
        reason: String,
    },
}

/// One MCP wire, normalized.
///
/// Frames are complete JSON-RPC envelopes as text; framing (newlines,
/// length prefixes, WS messages, HTTP bodies) is the implementation's
/// business. `receive` has a single consumer: the owning connection's
/// reader task.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which wire this is.
    fn kind(&self) -> TransportKind;

    /// Human-readable endpoint for logs and status surfaces.
    fn endpoint(&self) -> String;

    /// Current state. Cheap; safe to poll.
    fn state(&self) -> TransportState;

    /// Establish the connection (spawn the child, dial the socket, build
    /// the client). Idempotent when already connected.
    async fn connect(&self) -> TransportResult<()>;

    /// Tear the connection down cooperatively.
    async fn disconnect(&self) -> TransportResult<()>;

    /// Send one frame.
    async fn send(&self, frame: String) -> TransportResult<()>;

    /// Receive the next inbound frame. `Ok(None)` is clean end-of-stream;
    /// the peer is gone and will not speak again.
    async fn receive(&self) -> TransportResult<Option<String>>;
}
