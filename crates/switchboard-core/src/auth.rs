//! Bearer-token verification shared by both services.
//!
//! One configured token guards every non-public endpoint, compared in
//! constant time. With no token configured the services refuse everything
//! but loopback peers, which keeps an unconfigured dev setup usable without
//! ever exposing it off-box.

use std::net::IpAddr;

use subtle::ConstantTimeEq;

/// Verdict of a credential check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthVerdict {
    /// Request may proceed.
    Allowed,
    /// Missing or wrong credential.
    Denied,
}

/// The configured credential gate.
#[derive(Debug, Clone)]
pub struct TokenGate {
    token: Option<String>,
}

impl TokenGate {
    /// Gate for the configured token, `None` meaning loopback-only.
    pub fn new(token: Option<String>) -> Self {
        Self { token: token.filter(|t| !t.is_empty()) }
    }

    /// Whether a token is configured at all.
    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Check one request.
    ///
    /// `authorization` is the raw `Authorization` header value, if any;
    /// `peer` is the remote address of the connection.
    pub fn check(&self, authorization: Option<&str>, peer: IpAddr) -> AuthVerdict {
        match &self.token {
            Some(expected) => {
                let Some(header) = authorization else {
                    return AuthVerdict::Denied;
                };
                let Some(presented) = header.strip_prefix("Bearer ") else {
                    return AuthVerdict::Denied;
                };
                if presented.as_bytes().ct_eq(expected.as_bytes()).into() {
                    AuthVerdict::Allowed
                } else {
                    AuthVerdict::Denied
                }
            }
            None => {
                if peer.is_loopback() {
                    AuthVerdict::Allowed
                } else {
                    AuthVerdict::Denied
                }
            }
        }
    }
}
