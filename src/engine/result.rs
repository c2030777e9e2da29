//! Terminal per-batch results and per-record correlation.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::api::{ItemState, ItemStatus, ResponseSummary, SubmissionResponse};
use crate::error::{BatchFailure, FailureKind};

use super::adapter::SubmissionOutcome;
use super::batcher::Batch;
use super::retry::{RetryState, RetryTracker};

/// Final status of one record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RecordStatus {
    Accepted,
    Rejected { reason: String },
    /// Dropped by the API's own validation inside a successful call.
    Dropped { reason: String },
    /// The response reported drops that could not be tied to specific records.
    Indeterminate,
    /// The batch itself failed.
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOutcome {
    /// Position within the batch.
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transient_id: Option<String>,
    #[serde(flatten)]
    pub status: RecordStatus,
    /// Matched by position where ids were missing or inconsistent.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ambiguous: bool,
}

/// Record tallies for one batch. They always sum to the batch size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounts {
    pub accepted: u64,
    pub rejected: u64,
    pub dropped: u64,
    pub failed: u64,
}

impl BatchCounts {
    pub fn total(&self) -> u64 {
        self.accepted + self.rejected + self.dropped + self.failed
    }
}

/// The one and only result of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResult {
    pub sequence: u64,
    pub size: usize,
    pub state: RetryState,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<BatchFailure>,
    pub counts: BatchCounts,
    pub records: Vec<RecordOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_summary: Option<ResponseSummary>,
    /// Response items that could not be tied to a record of this batch.
    #[serde(default)]
    pub unmatched_items: u64,
    /// Time spent in the final attempt's exchange.
    pub elapsed_ms: u64,
}

impl BatchResult {
    /// Build the terminal result from the outcome that ended the retry loop.
    pub fn resolve(batch: &Batch, outcome: &SubmissionOutcome, tracker: &RetryTracker) -> Self {
        let elapsed_ms = outcome.elapsed.as_millis() as u64;

        if tracker.state == RetryState::Succeeded {
            let response = SubmissionResponse::parse_lenient(outcome.body.as_deref().unwrap_or(""));
            let correlation = correlate(batch, &response);
            if correlation.unmatched_items > 0 {
                warn!(
                    batch = batch.sequence(),
                    unmatched = correlation.unmatched_items,
                    "Response items could not be matched to submitted records"
                );
            }
            return Self {
                sequence: batch.sequence(),
                size: batch.len(),
                state: RetryState::Succeeded,
                attempts: tracker.attempts,
                status_code: outcome.status,
                error: None,
                counts: correlation.counts,
                records: correlation.records,
                response_summary: response.summary,
                unmatched_items: correlation.unmatched_items,
                elapsed_ms,
            };
        }

        let kind = outcome.failure.clone().unwrap_or(FailureKind::TransportFault);
        let error = match (&kind, tracker.state) {
            (FailureKind::Cancelled, _) => BatchFailure::Cancelled {
                detail: outcome.detail.clone(),
            },
            (_, RetryState::Exhausted) => BatchFailure::RetryExhausted {
                attempts: tracker.attempts,
                last: kind,
                detail: outcome.detail.clone(),
            },
            _ => BatchFailure::Fatal {
                kind,
                detail: outcome.detail.clone(),
            },
        };
        let state = if tracker.state == RetryState::Exhausted {
            RetryState::Exhausted
        } else {
            RetryState::Fatal
        };
        Self::failed(batch, state, tracker.attempts, outcome.status, error, elapsed_ms)
    }

    /// Result for a batch that was never attempted because the run was
    /// cancelled first.
    pub fn cancelled(batch: &Batch) -> Self {
        Self::failed(
            batch,
            RetryState::Fatal,
            0,
            None,
            BatchFailure::Cancelled {
                detail: "run cancelled before submission".into(),
            },
            0,
        )
    }

    fn failed(
        batch: &Batch,
        state: RetryState,
        attempts: u32,
        status_code: Option<u16>,
        error: BatchFailure,
        elapsed_ms: u64,
    ) -> Self {
        let records = batch
            .records()
            .iter()
            .enumerate()
            .map(|(index, r)| RecordOutcome {
                index,
                transient_id: r.transient_id.clone(),
                status: RecordStatus::Unresolved,
                ambiguous: false,
            })
            .collect();
        Self {
            sequence: batch.sequence(),
            size: batch.len(),
            state,
            attempts,
            status_code,
            error: Some(error),
            counts: BatchCounts {
                failed: batch.len() as u64,
                ..Default::default()
            },
            records,
            response_summary: None,
            unmatched_items: 0,
            elapsed_ms,
        }
    }

    pub fn is_success(&self) -> bool {
        self.state == RetryState::Succeeded
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.error.as_ref().map(BatchFailure::kind)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, Some(BatchFailure::Cancelled { .. }))
    }

    /// Look up a record by its transient id.
    pub fn record(&self, transient_id: &str) -> Option<&RecordOutcome> {
        self.records
            .iter()
            .find(|r| r.transient_id.as_deref() == Some(transient_id))
    }
}

struct Correlation {
    records: Vec<RecordOutcome>,
    counts: BatchCounts,
    unmatched_items: u64,
}

fn item_status(item: &ItemStatus) -> RecordStatus {
    let reason = || item.reason.clone().unwrap_or_default();
    match item.status {
        ItemState::Accepted => RecordStatus::Accepted,
        ItemState::Rejected => RecordStatus::Rejected { reason: reason() },
        ItemState::Dropped => RecordStatus::Dropped { reason: reason() },
        ItemState::Unknown => match &item.reason {
            Some(reason) => RecordStatus::Rejected {
                reason: reason.clone(),
            },
            None => RecordStatus::Accepted,
        },
    }
}

/// Tie response items back to the batch's records: by `transient_id` first,
/// then by position for items without one.
fn correlate(batch: &Batch, response: &SubmissionResponse) -> Correlation {
    let records = batch.records();
    let mut assigned: Vec<Option<(RecordStatus, bool)>> = vec![None; records.len()];
    let mut unmatched_items = 0u64;

    let mut by_id: HashMap<&str, Vec<usize>> = HashMap::new();
    for (idx, record) in records.iter().enumerate() {
        if let Some(id) = record.transient_id.as_deref() {
            by_id.entry(id).or_default().push(idx);
        }
    }

    let with_id = response
        .items
        .iter()
        .filter(|i| i.transient_id.is_some())
        .count();
    let mixed = with_id > 0 && with_id < response.items.len();

    for (pos, item) in response.items.iter().enumerate() {
        let target = match item.transient_id.as_deref() {
            Some(id) => match by_id.get(id).map(Vec::as_slice) {
                Some([idx]) if assigned[*idx].is_none() => Some((*idx, false)),
                _ => None,
            },
            None => match assigned.get(pos) {
                Some(None) => {
                    let ambiguous = mixed || records[pos].transient_id.is_some();
                    Some((pos, ambiguous))
                }
                _ => None,
            },
        };

        match target {
            Some((idx, ambiguous)) => {
                if ambiguous {
                    debug!(batch = batch.sequence(), index = idx, "Positional match flagged ambiguous");
                }
                assigned[idx] = Some((item_status(item), ambiguous));
            }
            None => unmatched_items += 1,
        }
    }

    // The API's `dropped` counter covers every item it did not process,
    // rejected ones included.
    let attributed_drops = assigned
        .iter()
        .filter(|a| {
            matches!(
                a,
                Some((RecordStatus::Dropped { .. } | RecordStatus::Rejected { .. }, _))
            )
        })
        .count() as u64;
    let unmentioned = assigned.iter().filter(|a| a.is_none()).count() as u64;
    let extra_drops = response
        .summary
        .map(|s| s.dropped.saturating_sub(attributed_drops))
        .unwrap_or(0)
        .min(unmentioned);

    let mut counts = BatchCounts::default();
    let mut outcomes = Vec::with_capacity(records.len());
    for (index, (record, slot)) in records.iter().zip(assigned).enumerate() {
        let (status, ambiguous) = match slot {
            Some(found) => found,
            None if extra_drops > 0 => (RecordStatus::Indeterminate, true),
            None => (RecordStatus::Accepted, false),
        };
        match &status {
            RecordStatus::Accepted => counts.accepted += 1,
            RecordStatus::Rejected { .. } => counts.rejected += 1,
            RecordStatus::Dropped { .. } => counts.dropped += 1,
            RecordStatus::Indeterminate | RecordStatus::Unresolved => {}
        }
        outcomes.push(RecordOutcome {
            index,
            transient_id: record.transient_id.clone(),
            status,
            ambiguous,
        });
    }
    if extra_drops > 0 {
        counts.dropped += extra_drops;
        counts.accepted += unmentioned - extra_drops;
    }

    Correlation {
        records: outcomes,
        counts,
        unmatched_items,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::DetectionRecord;
    use std::time::Duration;

    fn batch_with_ids(ids: &[Option<&str>]) -> Batch {
        let records = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let record = DetectionRecord::new("ip", format!("10.0.0.{i}"), "correlation");
                match id {
                    Some(id) => record.with_transient_id(*id),
                    None => record,
                }
            })
            .collect();
        Batch::new(4, records)
    }

    fn succeeded(batch: &Batch, body: &str) -> BatchResult {
        let outcome = SubmissionOutcome::success(200, body.to_string(), Duration::from_millis(12));
        let tracker = RetryTracker {
            state: RetryState::Succeeded,
            attempts: 1,
            ..Default::default()
        };
        BatchResult::resolve(batch, &outcome, &tracker)
    }

    #[test]
    fn rejected_item_keeps_reason_and_counts_as_rejected() {
        let batch = batch_with_ids(&[Some("x0"), Some("x1"), Some("x2")]);
        let result = succeeded(
            &batch,
            r#"{"summary": {"submitted": 3, "processed": 2, "dropped": 0},
                "data": [{"transient_id": "x1", "status": "rejected", "reason": "invalid ioc value"}]}"#,
        );

        assert!(result.is_success());
        assert_eq!(
            result.counts,
            BatchCounts {
                accepted: 2,
                rejected: 1,
                dropped: 0,
                failed: 0
            }
        );
        assert_eq!(
            result.record("x1").unwrap().status,
            RecordStatus::Rejected {
                reason: "invalid ioc value".into()
            }
        );
        assert_eq!(result.record("x0").unwrap().status, RecordStatus::Accepted);
        assert!(result.error.is_none());
        assert_eq!(result.elapsed_ms, 12);
    }

    #[test]
    fn rejected_items_count_against_summary_drops() {
        let batch = batch_with_ids(&[Some("x0"), Some("x1"), Some("x2")]);
        let result = succeeded(
            &batch,
            r#"{"summary": {"submitted": 3, "processed": 2, "dropped": 1},
                "data": [{"transient_id": "x1", "status": "rejected", "reason": "invalid ioc value"}]}"#,
        );
        assert_eq!(
            result.counts,
            BatchCounts {
                accepted: 2,
                rejected: 1,
                dropped: 0,
                failed: 0
            }
        );
        assert!(
            result
                .records
                .iter()
                .all(|r| r.status != RecordStatus::Indeterminate)
        );
        assert_eq!(result.record("x0").unwrap().status, RecordStatus::Accepted);
    }

    #[test]
    fn dropped_items_are_tallied_separately() {
        let batch = batch_with_ids(&[Some("a"), Some("b")]);
        let result = succeeded(
            &batch,
            r#"{"data": [{"transient_id": "b", "status": "dropped", "message": "duplicate"}]}"#,
        );
        assert_eq!(result.counts.dropped, 1);
        assert_eq!(result.counts.accepted, 1);
        assert_eq!(result.counts.rejected, 0);
        assert_eq!(
            result.record("b").unwrap().status,
            RecordStatus::Dropped {
                reason: "duplicate".into()
            }
        );
    }

    #[test]
    fn positional_fallback_without_ids() {
        let batch = batch_with_ids(&[None, None, None]);
        let result = succeeded(
            &batch,
            r#"{"data": [{"status": "accepted"}, {"status": "rejected", "reason": "bad"}, {"status": "accepted"}]}"#,
        );
        assert_eq!(result.counts.rejected, 1);
        assert_eq!(
            result.records[1].status,
            RecordStatus::Rejected { reason: "bad".into() }
        );
        assert!(result.records.iter().all(|r| !r.ambiguous));
    }

    #[test]
    fn mixed_ids_flag_positional_matches_as_ambiguous() {
        let batch = batch_with_ids(&[Some("a"), None, Some("c")]);
        let result = succeeded(
            &batch,
            r#"{"data": [
                {"transient_id": "c", "status": "rejected", "reason": "bad type"},
                {"status": "dropped", "reason": "stale"}
            ]}"#,
        );
        let second = &result.records[1];
        assert_eq!(second.status, RecordStatus::Dropped { reason: "stale".into() });
        assert!(second.ambiguous);
        assert!(!result.records[2].ambiguous);
        assert_eq!(result.counts.total(), 3);
    }

    #[test]
    fn unknown_and_duplicate_ids_are_not_attributed() {
        let batch = batch_with_ids(&[Some("a"), Some("b")]);
        let result = succeeded(
            &batch,
            r#"{"data": [
                {"transient_id": "zzz", "status": "rejected", "reason": "?"},
                {"transient_id": "a", "status": "rejected", "reason": "first"},
                {"transient_id": "a", "status": "accepted"}
            ]}"#,
        );
        assert_eq!(result.unmatched_items, 2);
        assert_eq!(
            result.record("a").unwrap().status,
            RecordStatus::Rejected { reason: "first".into() }
        );
        assert_eq!(result.counts.accepted, 1);
        assert_eq!(result.counts.rejected, 1);
    }

    #[test]
    fn summary_drops_without_items_are_indeterminate() {
        let batch = batch_with_ids(&[None, None, None, None]);
        let result = succeeded(
            &batch,
            r#"{"summary": {"submitted": 4, "processed": 3, "dropped": 1}}"#,
        );
        assert_eq!(result.counts.dropped, 1);
        assert_eq!(result.counts.accepted, 3);
        assert_eq!(result.counts.total(), 4);
        assert!(
            result
                .records
                .iter()
                .all(|r| r.status == RecordStatus::Indeterminate && r.ambiguous)
        );
        assert_eq!(result.response_summary.unwrap().processed, 3);
    }

    #[test]
    fn unparseable_body_accepts_everything() {
        let batch = batch_with_ids(&[None, None]);
        let result = succeeded(&batch, "not json");
        assert_eq!(result.counts.accepted, 2);
        assert!(result.response_summary.is_none());
    }

    #[test]
    fn exhausted_batch_marks_records_failed() {
        let batch = batch_with_ids(&[Some("a"), None]);
        let mut outcome =
            SubmissionOutcome::failed(FailureKind::ServerError, "HTTP 503: down", Duration::ZERO);
        outcome.status = Some(503);
        let tracker = RetryTracker {
            state: RetryState::Exhausted,
            attempts: 3,
            ..Default::default()
        };
        let result = BatchResult::resolve(&batch, &outcome, &tracker);

        assert_eq!(result.state, RetryState::Exhausted);
        assert_eq!(result.counts.failed, 2);
        assert_eq!(result.status_code, Some(503));
        assert!(result.records.iter().all(|r| r.status == RecordStatus::Unresolved));
        assert_eq!(
            result.error,
            Some(BatchFailure::RetryExhausted {
                attempts: 3,
                last: FailureKind::ServerError,
                detail: "HTTP 503: down".into()
            })
        );
    }

    #[test]
    fn fatal_and_cancelled_failures() {
        let batch = batch_with_ids(&[None]);
        let outcome = SubmissionOutcome::failed(FailureKind::Unauthorized, "HTTP 401", Duration::ZERO);
        let tracker = RetryTracker {
            state: RetryState::Fatal,
            attempts: 1,
            ..Default::default()
        };
        let result = BatchResult::resolve(&batch, &outcome, &tracker);
        assert_eq!(result.state, RetryState::Fatal);
        assert_eq!(result.failure_kind(), Some(FailureKind::Unauthorized));
        assert!(!result.is_cancelled());

        let cancelled = BatchResult::cancelled(&batch);
        assert!(cancelled.is_cancelled());
        assert_eq!(cancelled.attempts, 0);
        assert_eq!(cancelled.counts.failed, 1);
    }

    #[test]
    fn record_outcome_serializes_flat() {
        let outcome = RecordOutcome {
            index: 0,
            transient_id: Some("x1".into()),
            status: RecordStatus::Rejected {
                reason: "invalid ioc value".into(),
            },
            ambiguous: false,
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "index": 0,
                "transient_id": "x1",
                "status": "rejected",
                "reason": "invalid ioc value"
            })
        );
    }
}
