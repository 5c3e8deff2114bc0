//! Unified error taxonomy.
//!
//! Every failure a client can observe maps onto one [`ErrorKind`]. Internal
//! recovery (tool errors fed back to the model, breaker short-circuits
//! answered by fallback) happens before an error reaches this type; what is
//! left is serialized as `{error: {code, message, retry_after?}}` with the
//! status code from [`ErrorKind::http_status`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of service failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed request.
    Validation,
    /// Missing or invalid credential.
    Auth,
    /// Unknown model, server, or tool.
    NotFound,
    /// Budget ledger denied admission.
    BudgetExceeded,
    /// No provider can serve; breaker open or fallback exhausted.
    Unavailable,
    /// Deadline exceeded.
    Timeout,
    /// Client went away.
    Cancelled,
    /// Target short-circuited by a circuit breaker. Internal only; clients
    /// see `Unavailable`.
    BreakerOpen,
    /// MCP server returned a structured tool-level error. Recovered inside
    /// the agent loop, never surfaced as a request failure.
    ToolError,
    /// Bug or unrecoverable invariant violation.
    Internal,
}

impl ErrorKind {
    /// Stable machine-readable code used in response bodies.
    pub fn code(self) -> &'static str {
        match self {
            Self::Validation => "validation_error",
            Self::Auth => "authentication_error",
            Self::NotFound => "not_found",
            Self::BudgetExceeded => "budget_exceeded",
            Self::Unavailable => "unavailable",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::BreakerOpen => "unavailable",
            Self::ToolError => "tool_error",
            Self::Internal => "internal_error",
        }
    }

    /// HTTP status the gateway answers with.
    ///
    /// `budget_as_payment` selects 402 over 429 for budget denials (a
    /// deployment choice, see the gateway config).
    pub fn http_status(self, budget_as_payment: bool) -> u16 {
        match self {
            Self::Validation => 400,
            Self::Auth => 401,
            Self::NotFound => 404,
            Self::BudgetExceeded => {
                if budget_as_payment {
                    402
                } else {
                    429
                }
            }
            Self::Unavailable | Self::BreakerOpen => 503,
            Self::Timeout => 504,
            // The connection is gone; the status is never written.
            Self::Cancelled => 499,
            Self::ToolError | Self::Internal => 500,
        }
    }

    /// Whether the kind is only ever handled inside the services.
    pub fn is_internal_only(self) -> bool {
        matches!(self, Self::BreakerOpen | Self::ToolError)
    }
}

/// A classified service failure.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct ServiceError {
    /// Failure class.
    pub kind: ErrorKind,
    /// Human-readable description. Internal errors are logged with full
    /// context but surfaced with a generic message.
    pub message: String,
    /// Client backoff hint, seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ServiceError {
    /// Build an error of `kind`.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Malformed request.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    /// Missing or invalid credential.
    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Auth, message)
    }

    /// Unknown model, server, or tool.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// No provider can serve.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    /// Deadline exceeded.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    /// Bug or invariant violation. The message is for the log; clients see a
    /// generic body.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Attach a retry-after hint.
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// The body written to clients.
    ///
    /// Internal kinds are mapped to their public equivalents and internal
    /// messages are withheld.
    pub fn to_body(&self) -> ErrorBody {
        let (code, message) = match self.kind {
            ErrorKind::Internal => (self.kind.code(), "internal error".to_owned()),
            ErrorKind::BreakerOpen => (self.kind.code(), "service temporarily unavailable".to_owned()),
            _ => (self.kind.code(), self.message.clone()),
        };
        ErrorBody {
            error: ErrorBodyInner {
                code: code.to_owned(),
                message,
                retry_after: self.retry_after,
            },
        }
    }
}

/// Wire shape of a failure response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// The error object.
    pub error: ErrorBodyInner,
}

/// Inner error object of [`ErrorBody`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBodyInner {
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Client backoff hint, seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn status_mapping_matches_taxonomy() {
        assert_eq!(ErrorKind::Validation.http_status(false), 400);
        assert_eq!(ErrorKind::Auth.http_status(false), 401);
        assert_eq!(ErrorKind::NotFound.http_status(false), 404);
        assert_eq!(ErrorKind::BudgetExceeded.http_status(true), 402);
        assert_eq!(ErrorKind::BudgetExceeded.http_status(false), 429);
        assert_eq!(ErrorKind::Unavailable.http_status(false), 503);
        assert_eq!(ErrorKind::Timeout.http_status(false), 504);
        assert_eq!(ErrorKind::Internal.http_status(false), 500);
    }

    #[test]
    fn breaker_open_surfaces_as_unavailable() {
        let error = ServiceError::new(ErrorKind::BreakerOpen, "breaker open for time");
        assert_eq!(error.kind.http_status(false), 503);
        let body = error.to_body();
        assert_eq!(body.error.code, "unavailable");
        assert_eq!(body.error.message, "service temporarily unavailable");
    }

    #[test]
    fn internal_message_is_withheld_from_clients() {
        let error = ServiceError::internal("lock poisoned in catalog publish");
        let body = error.to_body();
        assert_eq!(body.error.message, "internal error");
    }

    #[test]
    fn retry_after_round_trips() {
        let error = ServiceError::unavailable("all providers down").with_retry_after(30);
        let body = error.to_body();
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["error"]["retry_after"], serde_json::json!(30));

        let plain = ServiceError::validation("empty messages").to_body();
        let json = serde_json::to_value(&plain).unwrap();
        assert!(json["error"].get("retry_after").is_none());
    }
}
