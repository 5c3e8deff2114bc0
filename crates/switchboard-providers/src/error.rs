//! Provider error taxonomy.

use switchboard_protocol::{ErrorKind, ServiceError};
use thiserror::Error;

/// Failures on the provider path.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// The backend is down, refused the connection, or answered 5xx.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The backend rate-limited us (429).
    #[error("provider rate limited")]
    RateLimited,

    /// The credential was rejected (401/403).
    #[error("provider rejected credentials: {0}")]
    Auth(String),

    /// Unknown provider or model.
    #[error("not found: {0}")]
    NotFound(String),

    /// The call or stream idled past its timeout.
    #[error("provider timed out")]
    Timeout,

    /// The backend answered with something unparseable.
    #[error("provider protocol error: {0}")]
    Protocol(String),

    /// The budget ledger denied admission.
    #[error("budget exceeded")]
    BudgetExceeded {
        /// Seconds until the next period opens.
        retry_after_secs: u64,
    },

    /// The consumer went away.
    #[error("cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Whether the fallback policy may engage for this failure.
    ///
    /// Only transient availability failures qualify; auth, validation, and
    /// budget denials are surfaced immediately and never retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::RateLimited | Self::Timeout)
    }

    /// Map to the client-facing taxonomy.
    pub fn to_service_error(&self) -> ServiceError {
        match self {
            Self::Unavailable(msg) => ServiceError::unavailable(msg.clone()),
            Self::RateLimited => {
                ServiceError::unavailable("provider rate limited").with_retry_after(30)
            }
            Self::Auth(msg) => ServiceError::new(ErrorKind::Auth, msg.clone()),
            Self::NotFound(msg) => ServiceError::not_found(msg.clone()),
            Self::Timeout => ServiceError::timeout("provider timed out"),
            Self::Protocol(msg) => ServiceError::internal(format!("provider protocol error: {msg}")),
            Self::BudgetExceeded { retry_after_secs } => {
                ServiceError::new(ErrorKind::BudgetExceeded, "daily budget exhausted")
                    .with_retry_after(*retry_after_secs)
            }
            Self::Cancelled => ServiceError::new(ErrorKind::Cancelled, "client disconnected"),
        }
    }

    /// Classify a `reqwest` failure.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Unavailable(format!("connect failed: {err}"))
        } else if err.is_decode() {
            Self::Protocol(err.to_string())
        } else {
            Self::Unavailable(err.to_string())
        }
    }

    /// Classify a non-success HTTP status.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let detail = if body.is_empty() {
            status.to_string()
        } else {
            format!("{status}: {}", body.chars().take(200).collect::<String>())
        };
        match status.as_u16() {
            401 | 403 => Self::Auth(detail),
            404 => Self::NotFound(detail),
            429 => Self::RateLimited,
            code if code >= 500 => Self::Unavailable(detail),
            _ => Self::Protocol(detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_gates_fallback() {
        assert!(ProviderError::Unavailable("503".into()).is_transient());
        assert!(ProviderError::RateLimited.is_transient());
        assert!(ProviderError::Timeout.is_transient());
        assert!(!ProviderError::Auth("bad key".into()).is_transient());
        assert!(!ProviderError::NotFound("no such model".into()).is_transient());
        assert!(!ProviderError::BudgetExceeded { retry_after_secs: 60 }.is_transient());
        assert!(!ProviderError::Cancelled.is_transient());
    }

    #[test]
    fn status_classification() {
        use reqwest::StatusCode;
        assert!(matches!(
            ProviderError::from_status(StatusCode::UNAUTHORIZED, ""),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            ProviderError::from_status(StatusCode::TOO_MANY_REQUESTS, ""),
            ProviderError::RateLimited
        ));
        assert!(matches!(
            ProviderError::from_status(StatusCode::SERVICE_UNAVAILABLE, "overloaded"),
            ProviderError::Unavailable(_)
        ));
        assert!(matches!(
            ProviderError::from_status(StatusCode::NOT_FOUND, ""),
            ProviderError::NotFound(_)
        ));
    }

    #[test]
    fn budget_denial_keeps_the_retry_hint() {
        let error = ProviderError::BudgetExceeded { retry_after_secs: 1_200 };
        let service = error.to_service_error();
        assert_eq!(service.retry_after, Some(1_200));
        assert_eq!(service.kind, ErrorKind::BudgetExceeded);
    }
}
