//! Error taxonomy for channel establishment.
//!
//! Each layer has its own enum so callers can tell a refused STARTTLS apart
//! from a rejected certificate or a wrong password without string matching:
//! - [`TransportError`]: socket and TLS engine failures, state violations
//! - [`VerifyError`]: certificate trust decisions
//! - [`StreamError`]: framed negotiation layer (timeouts, stream errors)
//! - [`SaslError`]: SASL exchange and mechanism failures
//! - [`ConnectError`]: everything surfaced by the orchestrator

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::transport::TransportState;

/// Failures of the Transport State Machine.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot {operation} in state {state:?}")]
    InvalidState {
        state: TransportState,
        operation: &'static str,
    },

    #[error("transport is not writable in state {0:?}")]
    NotWritable(TransportState),

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS engine error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("peer closed the connection during the TLS handshake")]
    HandshakeEof,

    #[error("certificate rejected after handshake: {0}")]
    CertificateRejected(#[from] VerifyError),

    #[error("invalid TLS configuration: {0}")]
    Config(String),
}

/// Outcome of a certificate trust evaluation that did not end in acceptance.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyError {
    #[error("certificate rejected: {reason}")]
    Rejected { reason: String },

    #[error("certificate needs explicit approval but no approval hook is configured")]
    NoApprovalHook,

    #[error("pre-handshake check failed: {0}")]
    PreHandshake(String),
}

/// Failures loading, saving or importing a pin store.
#[derive(Debug, Error)]
pub enum PinStoreError {
    #[error("pin store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pin store is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid pin store format: {0}")]
    InvalidFormat(String),
}

/// Failures of the framed negotiation layer.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("timed out after {}s waiting for {what}", .elapsed.as_secs())]
    Timeout { what: &'static str, elapsed: Duration },

    #[error("malformed XML: {0}")]
    Xml(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("stream error from peer: {condition}{}", .text.as_deref().map(|t| format!(" ({t})")).unwrap_or_default())]
    Peer {
        condition: String,
        text: Option<String>,
    },

    #[error("stream closed by peer")]
    Closed,

    #[error("negotiation buffer exceeded {limit} bytes")]
    BufferOverflow { limit: usize },
}

/// Failure conditions caused by the supplied credentials (RFC 6120 §6.5).
/// These are retried with a fresh credential prompt.
pub const AUTHENTICATION_FAILURES: &[&str] = &[
    "credentials-expired",
    "account-disabled",
    "invalid-authzid",
    "not-authorized",
    "temporary-auth-failure",
];

/// Failure conditions that reject the mechanism itself.
/// The mechanism is disabled and negotiation continues with the next one.
pub const MECHANISM_REJECTED_FAILURES: &[&str] = &["invalid-mechanism", "mechanism-too-weak"];

/// Coarse classification of a [`SaslError`], used by the provider loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslErrorCategory {
    Credentials,
    MechanismRejected,
    Protocol,
    Fatal,
}

/// Failures of the SASL negotiation engine.
#[derive(Debug, Error)]
pub enum SaslError {
    #[error("SASL failure: {condition}{}", .text.as_deref().map(|t| format!(" ({t})")).unwrap_or_default())]
    Failure {
        condition: String,
        text: Option<String>,
    },

    #[error("SASL protocol violation: {0}")]
    Protocol(String),

    #[error("server failed to prove knowledge of the credentials")]
    ServerAuthentication,

    #[error("authentication aborted: {0}")]
    Aborted(String),

    #[error("invalid credentials: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl SaslError {
    pub fn category(&self) -> SaslErrorCategory {
        match self {
            Self::Failure { condition, .. } => {
                if AUTHENTICATION_FAILURES.contains(&condition.as_str()) {
                    SaslErrorCategory::Credentials
                } else if MECHANISM_REJECTED_FAILURES.contains(&condition.as_str()) {
                    SaslErrorCategory::MechanismRejected
                } else {
                    SaslErrorCategory::Protocol
                }
            }
            Self::Protocol(_) => SaslErrorCategory::Protocol,
            Self::ServerAuthentication
            | Self::Aborted(_)
            | Self::InvalidInput(_)
            | Self::Stream(_) => SaslErrorCategory::Fatal,
        }
    }

    pub fn is_credential_failure(&self) -> bool {
        self.category() == SaslErrorCategory::Credentials
    }
}

/// Errors surfaced by [`crate::security_layer`] and [`crate::connector`].
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to connect to {addr}: {source}")]
    Io {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TCP connect timed out after {}s to {addr}", .elapsed.as_secs())]
    Timeout { addr: String, elapsed: Duration },

    #[error("all {} connection candidates failed: {}", .0.len(), join_errors(.0))]
    Multiple(Vec<ConnectError>),

    #[error("failed to resolve XMPP server: {0}")]
    Dns(String),

    #[error("TLS is required but unavailable: {0}")]
    TlsUnavailable(String),

    #[error("invalid TLS configuration: {0}")]
    TlsConfig(String),

    #[error("invalid security layer configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Sasl(#[from] SaslError),

    #[error("no common SASL mechanism")]
    NoCommonMechanism,
}

impl ConnectError {
    /// Collapse the errors of several connection candidates into one.
    ///
    /// A single error (or several with identical messages) is returned as-is;
    /// differing errors are wrapped in [`ConnectError::Multiple`].
    pub fn aggregate(mut errors: Vec<ConnectError>) -> Option<ConnectError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => {
                let first = errors[0].to_string();
                if errors.iter().all(|e| e.to_string() == first) {
                    errors.pop()
                } else {
                    Some(ConnectError::Multiple(errors))
                }
            }
        }
    }

    /// Socket address helper for [`ConnectError::Io`].
    pub fn io(addr: SocketAddr, source: std::io::Error) -> Self {
        Self::Io {
            addr: addr.to_string(),
            source,
        }
    }
}

fn join_errors(errors: &[ConnectError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
