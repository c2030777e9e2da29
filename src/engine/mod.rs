//! Concurrent batch submission engine.
//!
//! Records flow through [`Batcher`] into a pool of lanes run by the
//! [`Dispatcher`]; each lane drives one batch at a time through the
//! [`RetryController`] and hands the terminal [`BatchResult`] to the run's
//! [`Aggregator`].

mod adapter;
mod aggregator;
mod batcher;
mod cancel;
mod dispatcher;
mod result;
mod retry;

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::api::{DetectionRecord, SubmitOptions, Transport};
use crate::error::SubmitError;

pub use adapter::{OutcomeClass, SubmissionOutcome, TransportAdapter, classify_response};
pub use aggregator::{Aggregator, ProcessingSummary, RunMetrics};
pub use batcher::{Batch, Batcher};
pub use cancel::{CancellationSignal, SignalGuard};
pub use dispatcher::{BatchObserver, Dispatcher};
pub use result::{BatchCounts, BatchResult, RecordOutcome, RecordStatus};
pub use retry::{RetryController, RetryPolicy, RetryState, RetryTracker, Transition};

/// Tuning for one engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub batch_size: usize,
    /// Maximum number of batches in flight.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Cancel the run once this much time has passed.
    pub run_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            concurrency: 5,
            retry: RetryPolicy::default(),
            run_timeout: None,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), SubmitError> {
        if self.batch_size == 0 {
            return Err(SubmitError::InvalidConfiguration(
                "batch_size must be greater than zero".into(),
            ));
        }
        if self.concurrency == 0 {
            return Err(SubmitError::InvalidConfiguration(
                "concurrency must be greater than zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(SubmitError::InvalidConfiguration(format!(
                "jitter must be within [0, 1], got {}",
                self.retry.jitter
            )));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(SubmitError::InvalidConfiguration(
                "base delay must not exceed max delay".into(),
            ));
        }
        Ok(())
    }
}

/// Submits detection records over a [`Transport`].
///
/// One engine can serve several runs. Each run gets a fresh aggregator and
/// its own cancellation signal, linked to the engine's external one.
pub struct SubmissionEngine<T> {
    adapter: Arc<TransportAdapter<T>>,
    config: EngineConfig,
    concurrency: NonZeroUsize,
    cancel: CancellationSignal,
    observer: Option<Arc<dyn BatchObserver>>,
}

impl<T: Transport> SubmissionEngine<T> {
    pub fn new(transport: T, config: EngineConfig) -> Result<Self, SubmitError> {
        config.validate()?;
        let concurrency = NonZeroUsize::new(config.concurrency).ok_or_else(|| {
            SubmitError::InvalidConfiguration("concurrency must be greater than zero".into())
        })?;
        Ok(Self {
            adapter: Arc::new(TransportAdapter::new(transport)),
            config,
            concurrency,
            cancel: CancellationSignal::new(),
            observer: None,
        })
    }

    /// Use an externally owned signal, e.g. one wired to Ctrl+C. Firing it
    /// cancels the current run and every later one.
    pub fn with_cancellation(mut self, cancel: CancellationSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn BatchObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn cancellation(&self) -> CancellationSignal {
        self.cancel.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        self.adapter.transport()
    }

    /// Submit every record and return the frozen summary.
    ///
    /// Per-batch failures are reported inside the summary. The run itself
    /// fails only on invalid configuration, or with [`SubmitError::Cancelled`]
    /// (carrying the partial summary) when cancellation left batches
    /// unsubmitted.
    pub async fn run<S>(
        &self,
        records: S,
        options: SubmitOptions,
    ) -> Result<ProcessingSummary, SubmitError>
    where
        S: IntoIterator<Item = DetectionRecord>,
    {
        let batcher = Batcher::new(records, self.config.batch_size)?;
        let aggregator = Arc::new(Aggregator::new());
        info!(
            run_id = %aggregator.run_id(),
            batch_size = self.config.batch_size,
            concurrency = self.config.concurrency,
            max_retries = self.config.retry.max_retries,
            "Starting submission run"
        );

        let (cancel, _link) = self.cancel.child();
        let _timeout = self
            .config
            .run_timeout
            .map(|timeout| cancel.cancel_after(timeout));

        Dispatcher::new(
            self.adapter.clone(),
            self.config.retry.clone(),
            self.concurrency,
            Arc::new(options),
            aggregator.clone(),
            cancel,
        )
        .with_observer(self.observer.clone())
        .dispatch(batcher)
        .await;

        let summary = aggregator.finalize();
        if summary.cancelled {
            return Err(SubmitError::Cancelled {
                summary: Box::new(summary),
            });
        }
        Ok(summary)
    }
}

/// Submit `records` with default backoff and no run timeout.
pub async fn submit_detections<T, S>(
    transport: T,
    records: S,
    batch_size: usize,
    concurrency: usize,
    max_retries: u32,
    options: SubmitOptions,
) -> Result<ProcessingSummary, SubmitError>
where
    T: Transport,
    S: IntoIterator<Item = DetectionRecord>,
{
    let config = EngineConfig {
        batch_size,
        concurrency,
        retry: RetryPolicy::default().with_max_retries(max_retries),
        run_timeout: None,
    };
    SubmissionEngine::new(transport, config)?
        .run(records, options)
        .await
}
