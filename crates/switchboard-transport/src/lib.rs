//! MCP transport layer.
//!
//! Every MCP server, whatever it speaks, is normalized to one contract:
//! connect, exchange JSON-RPC frames, call tools. Four transports are
//! supported:
//!
//! | Transport | Framing |
//! |---|---|
//! | stdio (child process) | newline-delimited JSON |
//! | WebSocket | text frames |
//! | Unix socket | length-prefixed JSON |
//! | HTTP(S) | one envelope per POST body |
//!
//! [`connection::ServerConnection`] sits on top of any [`traits::Transport`]
//! and owns the request/response correlation: a single reader task drains
//! inbound frames and completes per-request oneshot waiters, while callers
//! multiplex concurrent `tools/call` invocations bounded by a per-server
//! semaphore.

pub mod backoff;
pub mod connection;
pub mod error;
pub mod http;
pub mod stdio;
pub mod traits;
pub mod unix;
pub mod ws;

pub use backoff::Backoff;
pub use connection::{ConnectionConfig, ServerConnection};
pub use error::{InvokeError, TransportError, TransportResult};
pub use http::HttpTransport;
pub use stdio::StdioTransport;
pub use traits::{Transport, TransportKind, TransportState};
pub use unix::UnixTransport;
pub use ws::WsTransport;
