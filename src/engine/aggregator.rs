//! Per-run result aggregation.
//!
//! Lanes call [`Aggregator::record`] concurrently; every mutation goes through
//! one mutex. [`Aggregator::finalize`] freezes the run into a
//! [`ProcessingSummary`] exactly once.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::FailureKind;

use super::batcher::Batch;
use super::result::{BatchResult, RecordOutcome, RecordStatus};
use super::retry::RetryState;

/// Timing and throughput for a finished run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub duration_ms: u64,
    pub records_per_second: f64,
    pub min_batch_ms: u64,
    pub max_batch_ms: u64,
    pub avg_batch_ms: f64,
    /// Exchanges across all batches, first attempts included.
    pub total_attempts: u64,
    pub retries: u64,
}

/// Frozen outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records_submitted: u64,
    pub records_accepted: u64,
    pub records_rejected: u64,
    pub records_dropped: u64,
    pub records_failed: u64,
    pub batches_total: u64,
    pub batches_succeeded: u64,
    pub batches_failed: u64,
    pub batches_exhausted: u64,
    pub batches_fatal: u64,
    pub batches_cancelled: u64,
    pub quota_exceeded: bool,
    pub cancelled: bool,
    /// True only when no batch failed.
    pub success: bool,
    pub batch_results: Vec<BatchResult>,
    pub metrics: RunMetrics,
}

impl ProcessingSummary {
    pub fn failed_batches(&self) -> impl Iterator<Item = &BatchResult> {
        self.batch_results.iter().filter(|b| !b.is_success())
    }

    /// Every record the API rejected, with its batch sequence.
    pub fn rejected_records(&self) -> impl Iterator<Item = (u64, &RecordOutcome)> {
        self.batch_results.iter().flat_map(|b| {
            b.records
                .iter()
                .filter(|r| matches!(r.status, RecordStatus::Rejected { .. }))
                .map(move |r| (b.sequence, r))
        })
    }

    pub fn record_status(&self, transient_id: &str) -> Option<&RecordStatus> {
        self.batch_results
            .iter()
            .find_map(|b| b.record(transient_id))
            .map(|r| &r.status)
    }

    pub fn batch(&self, sequence: u64) -> Option<&BatchResult> {
        self.batch_results.iter().find(|b| b.sequence == sequence)
    }
}

#[derive(Debug, Default)]
struct RunState {
    /// Sequence → size of every produced batch.
    registered: BTreeMap<u64, usize>,
    results: BTreeMap<u64, BatchResult>,
}

/// Collects batch results for one run.
#[derive(Debug)]
pub struct Aggregator {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    started: Instant,
    state: Mutex<RunState>,
    frozen: OnceLock<ProcessingSummary>,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            started: Instant::now(),
            state: Mutex::new(RunState::default()),
            frozen: OnceLock::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Account for a batch as soon as it is produced.
    pub fn register(&self, batch: &Batch) {
        if self.frozen.get().is_some() {
            warn!(batch = batch.sequence(), "Batch registered after finalize, ignoring");
            return;
        }
        self.lock().registered.insert(batch.sequence(), batch.len());
    }

    /// Store a batch's terminal result. A second result for the same batch,
    /// or any result after [`finalize`](Self::finalize), is dropped.
    pub fn record(&self, result: BatchResult) {
        if self.frozen.get().is_some() {
            warn!(batch = result.sequence, "Result recorded after finalize, ignoring");
            return;
        }
        let mut state = self.lock();
        if !state.registered.contains_key(&result.sequence) {
            state.registered.insert(result.sequence, result.size);
        }
        if state.results.contains_key(&result.sequence) {
            warn!(batch = result.sequence, "Duplicate batch result, ignoring");
            return;
        }
        state.results.insert(result.sequence, result);
    }

    /// Records in batches that were produced but have no result yet.
    pub fn unresolved(&self) -> u64 {
        let state = self.lock();
        state
            .registered
            .iter()
            .filter(|(seq, _)| !state.results.contains_key(seq))
            .map(|(_, size)| *size as u64)
            .sum()
    }

    pub fn is_finalized(&self) -> bool {
        self.frozen.get().is_some()
    }

    /// Freeze the run. Later calls return the same summary.
    pub fn finalize(&self) -> ProcessingSummary {
        self.frozen.get_or_init(|| self.build_summary()).clone()
    }

    fn build_summary(&self) -> ProcessingSummary {
        let state = self.lock();
        let finished_at = Utc::now();
        let duration = self.started.elapsed();

        let mut summary = ProcessingSummary {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at,
            records_submitted: state.registered.values().map(|s| *s as u64).sum(),
            records_accepted: 0,
            records_rejected: 0,
            records_dropped: 0,
            records_failed: 0,
            batches_total: state.registered.len() as u64,
            batches_succeeded: 0,
            batches_failed: 0,
            batches_exhausted: 0,
            batches_fatal: 0,
            batches_cancelled: 0,
            quota_exceeded: false,
            cancelled: false,
            success: false,
            batch_results: state.results.values().cloned().collect(),
            metrics: RunMetrics::default(),
        };

        for result in &summary.batch_results {
            summary.records_accepted += result.counts.accepted;
            summary.records_rejected += result.counts.rejected;
            summary.records_dropped += result.counts.dropped;
            summary.records_failed += result.counts.failed;

            if result.is_success() {
                summary.batches_succeeded += 1;
                continue;
            }
            summary.batches_failed += 1;
            if result.is_cancelled() {
                summary.batches_cancelled += 1;
                summary.cancelled = true;
            } else if result.state == RetryState::Exhausted {
                summary.batches_exhausted += 1;
            } else {
                summary.batches_fatal += 1;
            }
            if result.failure_kind() == Some(FailureKind::QuotaExceeded) {
                summary.quota_exceeded = true;
            }
        }

        for (sequence, size) in &state.registered {
            if !state.results.contains_key(sequence) {
                warn!(batch = sequence, records = size, "Batch finalized without a result");
                summary.records_failed += *size as u64;
                summary.batches_failed += 1;
                summary.batches_fatal += 1;
            }
        }

        summary.success = summary.batches_failed == 0;
        summary.metrics = metrics(&summary.batch_results, duration.as_millis() as u64, summary.records_submitted);

        info!(
            run_id = %summary.run_id,
            records = summary.records_submitted,
            accepted = summary.records_accepted,
            rejected = summary.records_rejected,
            dropped = summary.records_dropped,
            failed = summary.records_failed,
            batches = summary.batches_total,
            duration_ms = summary.metrics.duration_ms,
            "Run finalized"
        );
        summary
    }
}

fn metrics(results: &[BatchResult], duration_ms: u64, records: u64) -> RunMetrics {
    let attempted: Vec<u64> = results
        .iter()
        .filter(|r| r.attempts > 0)
        .map(|r| r.elapsed_ms)
        .collect();
    let total_attempts: u64 = results.iter().map(|r| u64::from(r.attempts)).sum();
    let retries: u64 = results
        .iter()
        .map(|r| u64::from(r.attempts.saturating_sub(1)))
        .sum();

    let records_per_second = if duration_ms == 0 {
        0.0
    } else {
        records as f64 / (duration_ms as f64 / 1000.0)
    };
    let avg_batch_ms = if attempted.is_empty() {
        0.0
    } else {
        attempted.iter().sum::<u64>() as f64 / attempted.len() as f64
    };

    RunMetrics {
        duration_ms,
        records_per_second,
        min_batch_ms: attempted.iter().copied().min().unwrap_or(0),
        max_batch_ms: attempted.iter().copied().max().unwrap_or(0),
        avg_batch_ms,
        total_attempts,
        retries,
    }
}
