//! Bounded worker pool that drives batches through the retry controller.

use std::num::NonZeroUsize;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::api::{SubmitOptions, Transport};

use super::adapter::TransportAdapter;
use super::aggregator::Aggregator;
use super::batcher::Batch;
use super::cancel::CancellationSignal;
use super::result::BatchResult;
use super::retry::{RetryController, RetryPolicy};

/// Called once for every batch that reaches a terminal result.
pub trait BatchObserver: Send + Sync {
    fn on_batch_complete(&self, result: &BatchResult);
}

type SharedReceiver = Arc<Mutex<mpsc::Receiver<Batch>>>;

/// Everything a lane needs, shared across the pool.
struct Lane<T> {
    adapter: Arc<TransportAdapter<T>>,
    policy: RetryPolicy,
    options: Arc<SubmitOptions>,
    aggregator: Arc<Aggregator>,
    cancel: CancellationSignal,
    observer: Option<Arc<dyn BatchObserver>>,
}

impl<T> Clone for Lane<T> {
    fn clone(&self) -> Self {
        Self {
            adapter: self.adapter.clone(),
            policy: self.policy.clone(),
            options: self.options.clone(),
            aggregator: self.aggregator.clone(),
            cancel: self.cancel.clone(),
            observer: self.observer.clone(),
        }
    }
}

impl<T: Transport> Lane<T> {
    async fn work(self, id: usize, queue: SharedReceiver) {
        loop {
            let next = {
                let mut queue = queue.lock().await;
                queue.recv().await
            };
            let Some(batch) = next else {
                debug!(lane = id, "Queue closed, lane exiting");
                return;
            };

            let result = if self.cancel.is_cancelled() {
                BatchResult::cancelled(&batch)
            } else {
                let (outcome, tracker) = RetryController::run(
                    &self.adapter,
                    &self.policy,
                    &batch,
                    &self.options,
                    &self.cancel,
                )
                .await;
                BatchResult::resolve(&batch, &outcome, &tracker)
            };
            self.complete(result);
        }
    }

    fn complete(&self, result: BatchResult) {
        if result.is_success() {
            debug!(
                batch = result.sequence,
                attempts = result.attempts,
                accepted = result.counts.accepted,
                rejected = result.counts.rejected,
                "Batch succeeded"
            );
        } else if !result.is_cancelled() {
            error!(
                batch = result.sequence,
                state = %result.state,
                attempts = result.attempts,
                error = ?result.error,
                "Batch failed"
            );
        }
        if let Some(observer) = &self.observer {
            observer.on_batch_complete(&result);
        }
        self.aggregator.record(result);
    }
}

/// Runs up to `concurrency` batches at once.
pub struct Dispatcher<T> {
    lane: Lane<T>,
    concurrency: NonZeroUsize,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(
        adapter: Arc<TransportAdapter<T>>,
        policy: RetryPolicy,
        concurrency: NonZeroUsize,
        options: Arc<SubmitOptions>,
        aggregator: Arc<Aggregator>,
        cancel: CancellationSignal,
    ) -> Self {
        Self {
            lane: Lane {
                adapter,
                policy,
                options,
                aggregator,
                cancel,
                observer: None,
            },
            concurrency,
        }
    }

    pub fn with_observer(mut self, observer: Option<Arc<dyn BatchObserver>>) -> Self {
        self.lane.observer = observer;
        self
    }

    /// Feed `batches` to the pool and wait until every produced batch has a
    /// result in the aggregator.
    ///
    /// The source is pulled on the calling task, one batch ahead of the
    /// queue, so it need not be `Send`. After cancellation the source is
    /// still drained and each remaining batch is resolved as cancelled.
    ///
    /// # Panics
    ///
    /// Resumes the panic of any lane that panicked.
    pub async fn dispatch<I>(self, batches: I)
    where
        I: Iterator<Item = Batch>,
    {
        let capacity = self.concurrency.get();
        let (tx, rx) = mpsc::channel::<Batch>(capacity);
        let queue: SharedReceiver = Arc::new(Mutex::new(rx));

        let mut lanes = JoinSet::new();
        for id in 0..capacity {
            lanes.spawn(self.lane.clone().work(id, queue.clone()));
        }
        drop(queue);

        let cancel = &self.lane.cancel;
        let aggregator = &self.lane.aggregator;
        let mut batches = batches;
        let mut produced = 0u64;
        let mut skipped = 0u64;
        let mut orphaned = None;

        for batch in batches.by_ref() {
            aggregator.register(&batch);
            produced += 1;

            let slot = if cancel.is_cancelled() {
                Slot::Cancelled
            } else {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Slot::Cancelled,
                    permit = tx.reserve() => match permit {
                        Ok(permit) => Slot::Ready(permit),
                        Err(_) => Slot::Closed,
                    },
                }
            };
            match slot {
                Slot::Ready(permit) => permit.send(batch),
                Slot::Cancelled => {
                    skipped += 1;
                    self.lane.complete(BatchResult::cancelled(&batch));
                }
                // Every lane is gone; joining below surfaces the reason.
                Slot::Closed => {
                    orphaned = Some(batch);
                    break;
                }
            }
        }
        drop(tx);

        if skipped > 0 {
            warn!(skipped, "Batches resolved as cancelled without submission");
        }
        info!(batches = produced, "All batches queued, waiting for lanes");

        while let Some(joined) = lanes.join_next().await {
            if let Err(err) = joined {
                if err.is_panic() {
                    lanes.abort_all();
                    std::panic::resume_unwind(err.into_panic());
                }
                warn!(error = %err, "Lane ended unexpectedly");
            }
        }

        if let Some(batch) = orphaned {
            error!("Lanes exited before the queue drained");
            for batch in std::iter::once(batch).chain(batches) {
                aggregator.register(&batch);
                self.lane.complete(BatchResult::cancelled(&batch));
            }
        }
    }
}

/// What the producer got while waiting for queue capacity.
enum Slot<'a> {
    Ready(mpsc::Permit<'a, Batch>),
    Cancelled,
    Closed,
}
