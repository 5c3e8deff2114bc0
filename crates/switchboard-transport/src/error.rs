//! Transport and invocation error types.

use thiserror::Error;

/// Result alias for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Errors raised by a transport while moving frames.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum TransportError {
    /// Failed to establish a connection.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// An established connection was lost.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Failed to send a frame.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Failed to receive a frame.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Frame could not be serialized or decoded.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Operation attempted while disconnected.
    #[error("transport not connected")]
    NotConnected,
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::ConnectionLost(err.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Outcome taxonomy of one `invoke(server, tool, args, deadline)`.
///
/// The agent loop pattern-matches on this instead of catching exceptions;
/// only the variants [`InvokeError::feeds_breaker`] admits count against a
/// target's circuit breaker.
#[derive(Debug, Clone, Error)]
pub enum InvokeError {
    /// Transport-level failure: the server could not be reached or the
    /// connection died mid-call.
    #[error("server unreachable: {0}")]
    Unreachable(String),

    /// The server answered with something that is not valid protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server returned a structured tool-level error. Fed back to the
    /// model as an observation, never a request failure.
    #[error("tool error: {0}")]
    ToolError(String),

    /// The call exceeded its deadline.
    #[error("tool call timed out")]
    Timeout,

    /// The enclosing request was cancelled.
    #[error("tool call cancelled")]
    Cancelled,

    /// The server is disabled in configuration.
    #[error("server disabled")]
    Disabled,
}

impl InvokeError {
    /// Whether this failure counts against the target's breaker.
    ///
    /// Tool-level errors and cancellations say nothing about server health;
    /// unreachable, protocol, and timeout failures do.
    pub fn feeds_breaker(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Protocol(_) | Self::Timeout)
    }
}

impl From<TransportError> for InvokeError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Serialization(msg) => Self::Protocol(msg),
            other => Self::Unreachable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_feeding_classification() {
        assert!(InvokeError::Unreachable("refused".into()).feeds_breaker());
        assert!(InvokeError::Protocol("bad frame".into()).feeds_breaker());
        assert!(InvokeError::Timeout.feeds_breaker());
        assert!(!InvokeError::ToolError("city unknown".into()).feeds_breaker());
        assert!(!InvokeError::Cancelled.feeds_breaker());
        assert!(!InvokeError::Disabled.feeds_breaker());
    }

    #[test]
    fn transport_errors_map_to_invoke_taxonomy() {
        let invoke: InvokeError = TransportError::NotConnected.into();
        assert!(matches!(invoke, InvokeError::Unreachable(_)));

        let invoke: InvokeError = TransportError::Serialization("truncated".into()).into();
        assert!(matches!(invoke, InvokeError::Protocol(_)));
    }
}
