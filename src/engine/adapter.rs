//! Transport adapter: one exchange per call, classified into a
//! [`SubmissionOutcome`].

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::{RawResponse, SubmissionRequest, SubmitOptions, Transport, TransportError};
use crate::error::FailureKind;

use super::batcher::Batch;

/// Coarse classification of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeClass {
    Success,
    RetryableFailure,
    FatalFailure,
}

/// Result of one transport attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionOutcome {
    pub class: OutcomeClass,
    pub failure: Option<FailureKind>,
    pub status: Option<u16>,
    pub body: Option<String>,
    /// Human-readable failure detail; empty on success.
    pub detail: String,
    pub elapsed: Duration,
    /// 1-based attempt number that produced this outcome.
    pub attempt: u32,
}

impl SubmissionOutcome {
    pub fn success(status: u16, body: String, elapsed: Duration) -> Self {
        Self {
            class: OutcomeClass::Success,
            failure: None,
            status: Some(status),
            body: Some(body),
            detail: String::new(),
            elapsed,
            attempt: 1,
        }
    }

    pub fn failed(kind: FailureKind, detail: impl Into<String>, elapsed: Duration) -> Self {
        let class = if kind.is_retryable() {
            OutcomeClass::RetryableFailure
        } else {
            OutcomeClass::FatalFailure
        };
        Self {
            class,
            failure: Some(kind),
            status: None,
            body: None,
            detail: detail.into(),
            elapsed,
            attempt: 1,
        }
    }

    pub fn cancelled(attempt: u32) -> Self {
        let mut outcome = Self::failed(FailureKind::Cancelled, "run cancelled", Duration::ZERO);
        outcome.attempt = attempt;
        outcome
    }

    fn with_response(mut self, status: u16, body: String) -> Self {
        self.status = Some(status);
        self.body = Some(body);
        self
    }

    pub fn is_success(&self) -> bool {
        self.class == OutcomeClass::Success
    }

    /// Delay requested by the server via `Retry-After`, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self.failure {
            Some(FailureKind::RateLimited {
                retry_after_ms: Some(ms),
            }) => Some(Duration::from_millis(ms)),
            _ => None,
        }
    }
}

/// Wraps a [`Transport`] with payload checks, timing and classification.
pub struct TransportAdapter<T> {
    transport: T,
}

impl<T: Transport> TransportAdapter<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Perform exactly one exchange for `batch`. Never fails: every problem is
    /// folded into the returned outcome.
    pub async fn submit(&self, batch: &Batch, options: &SubmitOptions) -> SubmissionOutcome {
        if let Err(detail) = validate_records(batch) {
            debug!(batch = batch.sequence(), %detail, "Batch rejected locally");
            return SubmissionOutcome::failed(FailureKind::MalformedRequest, detail, Duration::ZERO);
        }

        let request = SubmissionRequest::new(batch.records(), options);
        let started = Instant::now();
        let result = self.transport.send(&request).await;
        let elapsed = started.elapsed();

        match result {
            Ok(response) => classify_response(response, elapsed),
            Err(err) => classify_error(&err, elapsed),
        }
    }
}

/// Map an HTTP response to an outcome.
pub fn classify_response(response: RawResponse, elapsed: Duration) -> SubmissionOutcome {
    let RawResponse {
        status,
        body,
        retry_after,
    } = response;

    if (200..300).contains(&status) {
        return SubmissionOutcome::success(status, body, elapsed);
    }

    let message = error_message(status, &body);
    let kind = match status {
        429 | 403 if mentions_quota(&message) => FailureKind::QuotaExceeded,
        429 => FailureKind::RateLimited {
            retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
        },
        400 => FailureKind::BadRequest,
        401 => FailureKind::Unauthorized,
        403 => FailureKind::Forbidden,
        402..=499 => FailureKind::ClientError,
        500..=599 => FailureKind::ServerError,
        _ => FailureKind::TransportFault,
    };

    SubmissionOutcome::failed(kind, format!("HTTP {status}: {message}"), elapsed)
        .with_response(status, body)
}

fn classify_error(err: &TransportError, elapsed: Duration) -> SubmissionOutcome {
    SubmissionOutcome::failed(err.failure_kind(), err.to_string(), elapsed)
}

/// Pull a readable message out of an error body: JSON `message` or `error`,
/// then the raw text, then the canonical reason phrase.
fn error_message(status: u16, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["message", "error"] {
            if let Some(text) = value.get(key).and_then(|v| v.as_str()) {
                return text.to_string();
            }
        }
    }
    let trimmed = body.trim();
    if !trimmed.is_empty() {
        return trimmed.to_string();
    }
    reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("unknown error")
        .to_string()
}

fn mentions_quota(message: &str) -> bool {
    message.to_ascii_lowercase().contains("quota")
}

/// Minimal structural checks the API would reject with a 400 anyway.
fn validate_records(batch: &Batch) -> Result<(), String> {
    for (idx, record) in batch.records().iter().enumerate() {
        if record.ioc.ioc_type.trim().is_empty() {
            return Err(format!("record {idx}: ioc.type is empty"));
        }
        if record.ioc.value.trim().is_empty() {
            return Err(format!("record {idx}: ioc.value is empty"));
        }
        if record.detection.detection_type.trim().is_empty() {
            return Err(format!("record {idx}: detection.type is empty"));
        }
        if record.detection.detection_type == "detection_rule"
            && record
                .detection
                .sub_type
                .as_deref()
                .is_none_or(|s| s.trim().is_empty())
        {
            return Err(format!(
                "record {idx}: detection.sub_type is required for detection_rule"
            ));
        }
    }
    Ok(())
}
