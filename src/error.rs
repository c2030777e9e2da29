use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::ProcessingSummary;

/// Run-level errors. Per-batch failures never surface here; they are
/// recorded in the [`ProcessingSummary`].
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Run cancelled ({} batch(es) not submitted)", .summary.batches_cancelled)]
    Cancelled { summary: Box<ProcessingSummary> },

    #[error("Config error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Why a single transport attempt did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// HTTP 429. `retry_after_ms` comes from the `Retry-After` header.
    RateLimited { retry_after_ms: Option<u64> },
    /// HTTP 5xx.
    ServerError,
    /// Connection refused, reset, DNS failure.
    Network,
    /// Request exceeded the client timeout.
    Timeout,
    /// HTTP 400.
    BadRequest,
    /// HTTP 401.
    Unauthorized,
    /// HTTP 403.
    Forbidden,
    /// Any other 4xx: the request is wrong and resending it cannot help.
    ClientError,
    /// The remote submission budget is spent.
    QuotaExceeded,
    /// Payload rejected locally before any network call.
    MalformedRequest,
    /// Anything the classifier does not recognize. Retried once.
    TransportFault,
    /// The run was cancelled while this batch was pending or in flight.
    Cancelled,
}

impl FailureKind {
    /// Whether waiting and re-attempting can plausibly help.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::RateLimited { .. }
                | FailureKind::ServerError
                | FailureKind::Network
                | FailureKind::Timeout
                | FailureKind::TransportFault
        )
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::RateLimited {
                retry_after_ms: Some(ms),
            } => write!(f, "rate limited (retry after {ms}ms)"),
            FailureKind::RateLimited { retry_after_ms: None } => write!(f, "rate limited"),
            FailureKind::ServerError => write!(f, "server error"),
            FailureKind::Network => write!(f, "network error"),
            FailureKind::Timeout => write!(f, "request timed out"),
            FailureKind::BadRequest => write!(f, "bad request"),
            FailureKind::Unauthorized => write!(f, "authentication failed"),
            FailureKind::Forbidden => write!(f, "access denied"),
            FailureKind::ClientError => write!(f, "client error"),
            FailureKind::QuotaExceeded => write!(f, "quota exceeded"),
            FailureKind::MalformedRequest => write!(f, "malformed request"),
            FailureKind::TransportFault => write!(f, "unexpected transport fault"),
            FailureKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Terminal failure attached to a [`BatchResult`](crate::engine::BatchResult).
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchFailure {
    /// Retrying cannot help: credentials, payload or quota.
    #[error("fatal: {kind}: {detail}")]
    Fatal { kind: FailureKind, detail: String },

    /// Transient failures outlasted the retry budget.
    #[error("retries exhausted after {attempts} attempt(s): {last}: {detail}")]
    RetryExhausted {
        attempts: u32,
        last: FailureKind,
        detail: String,
    },

    #[error("cancelled: {detail}")]
    Cancelled { detail: String },
}

impl BatchFailure {
    /// The failure kind that ended the batch.
    pub fn kind(&self) -> FailureKind {
        match self {
            BatchFailure::Fatal { kind, .. } => kind.clone(),
            BatchFailure::RetryExhausted { last, .. } => last.clone(),
            BatchFailure::Cancelled { .. } => FailureKind::Cancelled,
        }
    }
}
