//! Errors raised by a [`Transport`](super::Transport) when no HTTP response
//! was obtained at all.

use thiserror::Error;

use crate::error::FailureKind;

/// Failure of the network exchange itself. HTTP error statuses are not
/// errors at this level; they come back as a [`RawResponse`](super::RawResponse).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The request exceeded the configured timeout.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Connection could not be established (DNS, refused, TLS).
    #[error("connection failed: {0}")]
    Connect(String),

    /// The connection broke while sending or receiving.
    #[error("network error: {0}")]
    Network(String),

    /// Anything else the client reported.
    #[error("transport fault: {0}")]
    Other(String),
}

impl TransportError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            TransportError::Timeout(_) => FailureKind::Timeout,
            TransportError::Connect(_) | TransportError::Network(_) => FailureKind::Network,
            TransportError::Other(_) => FailureKind::TransportFault,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout(e.to_string())
        } else if e.is_connect() {
            TransportError::Connect(e.to_string())
        } else if e.is_request() || e.is_body() {
            TransportError::Network(e.to_string())
        } else {
            TransportError::Other(e.to_string())
        }
    }
}
