//! Error types for proxy operations.
//!
//! This module defines structured error types for the proxy engine:
//! - Listener errors (binding, accept)
//! - TLS errors (certificate issuance, handshake)
//! - Connection errors (upstream dial, forwarding)
//! - Request errors (unresolvable target, abandoned hooks)

use crate::ca::CaError;
use std::net::SocketAddr;
use thiserror::Error;

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error (socket operations).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// A listener could not bind its address.
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        /// Address the listener tried to bind.
        addr: SocketAddr,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Invalid CONNECT request.
    #[error("Invalid CONNECT request: {0}")]
    InvalidConnect(String),

    /// Request target could not be resolved.
    #[error("Invalid request target: {0}")]
    InvalidTarget(String),

    /// TLS error during handshake or context construction.
    #[error("TLS error: {0}")]
    Tls(String),

    /// TLS client did not send a server name.
    #[error("TLS client hello carried no server name")]
    MissingSni,

    /// Certificate issuance failed.
    #[error("Certificate error: {0}")]
    Certificate(#[from] CaError),

    /// Upstream dial timed out.
    #[error("Timed out connecting to '{0}'")]
    Timeout(String),

    /// Failed to connect to upstream server.
    #[error("Failed to connect to upstream '{addr}': {message}")]
    UpstreamConnect {
        /// The address we tried to connect to.
        addr: String,
        /// Error message.
        message: String,
    },

    /// A hook took over a request but supplied no response.
    #[error("Hook '{0}' handled the request without responding")]
    Unanswered(&'static str),

    /// Upgrade to tunnel failed.
    #[error("HTTP upgrade failed: {0}")]
    UpgradeFailed(String),
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

impl ProxyError {
    /// Whether this error is routine peer behaviour rather than a fault.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProxyError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionAborted
            ),
            ProxyError::Http(e) => e.is_incomplete_message() || e.is_canceled(),
            ProxyError::Unanswered(_) => true,
            _ => false,
        }
    }
}

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}
