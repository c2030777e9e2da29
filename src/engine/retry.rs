use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::api::{SubmitOptions, Transport};
use crate::error::FailureKind;

use super::adapter::{OutcomeClass, SubmissionOutcome, TransportAdapter};
use super::batcher::Batch;
use super::cancel::CancellationSignal;

/// Backoff and budget settings for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed per batch. `0` and `1` both mean a single
    /// attempt with no retry.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Fraction in `[0, 1]` of each exponential step added as random jitter.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Attempts a batch may consume.
    pub fn attempt_budget(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Deterministic part of the delay after the `failures`-th failure:
    /// `base_delay * 2^(failures - 1)`, capped.
    pub fn base_delay_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Delay after the `failures`-th failure with jitter `sample` in `[0, 1)`.
    ///
    /// The jittered range for step `n` is `[b·2^(n-1), b·2^n)`, so successive
    /// delays never decrease.
    pub fn delay_with_sample(&self, failures: u32, sample: f64) -> Duration {
        let step = self.base_delay_for(failures);
        let jitter = self.jitter.clamp(0.0, 1.0) * sample.clamp(0.0, 1.0);
        Duration::try_from_secs_f64(step.as_secs_f64() * (1.0 + jitter))
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn delay_for(&self, failures: u32) -> Duration {
        self.delay_with_sample(failures, rand::random::<f64>())
    }
}

/// Per-batch retry state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryState {
    Attempting,
    Succeeded,
    Exhausted,
    Fatal,
}

impl RetryState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RetryState::Attempting)
    }
}

impl fmt::Display for RetryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryState::Attempting => write!(f, "ATTEMPTING"),
            RetryState::Succeeded => write!(f, "SUCCEEDED"),
            RetryState::Exhausted => write!(f, "EXHAUSTED"),
            RetryState::Fatal => write!(f, "FATAL"),
        }
    }
}

/// What to do after an attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Wait `delay`, then attempt again.
    Retry { delay: Duration, reason: FailureKind },
    /// Stop in the given terminal state.
    Complete(RetryState),
}

/// Bookkeeping for one batch's attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryTracker {
    pub state: RetryState,
    pub attempts: u32,
    pub faults: u32,
    pub delays: Vec<Duration>,
}

impl Default for RetryTracker {
    fn default() -> Self {
        Self {
            state: RetryState::Attempting,
            attempts: 0,
            faults: 0,
            delays: Vec::new(),
        }
    }
}

/// Drives the retry state machine for a batch.
pub struct RetryController;

impl RetryController {
    /// Record one attempt's outcome and compute the next transition.
    ///
    /// - success → `Succeeded`
    /// - fatal → `Fatal`, no further attempts
    /// - retryable → `Exhausted` once the attempt budget is spent or a second
    ///   transport fault is seen, otherwise `Retry` with a backoff delay.
    pub fn next(
        tracker: &mut RetryTracker,
        policy: &RetryPolicy,
        outcome: &SubmissionOutcome,
    ) -> Transition {
        tracker.attempts += 1;

        let transition = match outcome.class {
            OutcomeClass::Success => Transition::Complete(RetryState::Succeeded),
            OutcomeClass::FatalFailure => Transition::Complete(RetryState::Fatal),
            OutcomeClass::RetryableFailure => {
                let reason = outcome
                    .failure
                    .clone()
                    .unwrap_or(FailureKind::TransportFault);
                if reason == FailureKind::TransportFault {
                    tracker.faults += 1;
                }

                if tracker.attempts >= policy.attempt_budget() || tracker.faults > 1 {
                    Transition::Complete(RetryState::Exhausted)
                } else {
                    let mut delay = policy.delay_for(tracker.attempts);
                    if let Some(requested) = outcome.retry_after() {
                        delay = delay.max(requested.min(policy.max_delay));
                    }
                    Transition::Retry { delay, reason }
                }
            }
        };

        match &transition {
            Transition::Retry { delay, .. } => tracker.delays.push(*delay),
            Transition::Complete(state) => tracker.state = *state,
        }
        transition
    }

    /// Run attempts for `batch` until a terminal state. Returns the outcome
    /// that ended the loop (its `attempt` field set) and the tracker.
    pub async fn run<T: Transport>(
        adapter: &TransportAdapter<T>,
        policy: &RetryPolicy,
        batch: &Batch,
        options: &SubmitOptions,
        cancel: &CancellationSignal,
    ) -> (SubmissionOutcome, RetryTracker) {
        let mut tracker = RetryTracker::default();

        loop {
            if cancel.is_cancelled() {
                return Self::cancelled(tracker);
            }

            let attempt = tracker.attempts + 1;
            let mut outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // An interrupted request still counts as an attempt.
                    tracker.attempts = attempt;
                    return Self::cancelled(tracker);
                }
                outcome = adapter.submit(batch, options) => outcome,
            };
            outcome.attempt = attempt;

            match Self::next(&mut tracker, policy, &outcome) {
                Transition::Complete(state) => {
                    debug!(
                        batch = batch.sequence(),
                        attempts = tracker.attempts,
                        %state,
                        "Batch reached terminal state"
                    );
                    return (outcome, tracker);
                }
                Transition::Retry { delay, reason } => {
                    warn!(
                        batch = batch.sequence(),
                        attempt,
                        max = policy.attempt_budget(),
                        %reason,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying batch"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Self::cancelled(tracker),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    fn cancelled(mut tracker: RetryTracker) -> (SubmissionOutcome, RetryTracker) {
        tracker.state = RetryState::Fatal;
        (SubmissionOutcome::cancelled(tracker.attempts), tracker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{DetectionRecord, RawResponse, SubmissionRequest, TransportError};
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_retries(max_retries)
            .with_delays(Duration::from_millis(1), Duration::from_millis(5))
    }

    fn batch() -> Batch {
        Batch::new(0, vec![DetectionRecord::new("ip", "1.2.3.4", "correlation")])
    }

    /// Replays scripted statuses, then repeats the last one.
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<RawResponse, TransportError>>>,
        last: Result<RawResponse, TransportError>,
        calls: AtomicU32,
    }

    impl ScriptedTransport {
        fn statuses(statuses: &[u16]) -> Self {
            let script: VecDeque<_> = statuses
                .iter()
                .map(|s| Ok(RawResponse::new(*s, "{}")))
                .collect();
            let last = script.back().cloned().unwrap();
            Self {
                script: Mutex::new(script),
                last,
                calls: AtomicU32::new(0),
            }
        }

        fn errors(err: TransportError) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                last: Err(err),
                calls: AtomicU32::new(0),
            }
        }
    }

    impl Transport for ScriptedTransport {
        async fn send(
            &self,
            _request: &SubmissionRequest<'_>,
        ) -> Result<RawResponse, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or_else(|| self.last.clone())
        }
    }

    async fn run_script(
        transport: ScriptedTransport,
        policy: &RetryPolicy,
    ) -> (SubmissionOutcome, RetryTracker, u32) {
        let adapter = TransportAdapter::new(transport);
        let (outcome, tracker) = RetryController::run(
            &adapter,
            policy,
            &batch(),
            &SubmitOptions::default(),
            &CancellationSignal::new(),
        )
        .await;
        let calls = adapter.transport().calls.load(Ordering::SeqCst);
        (outcome, tracker, calls)
    }

    #[test]
    fn exponential_backoff_without_jitter() {
        let policy = RetryPolicy::default()
            .with_delays(Duration::from_millis(1000), Duration::from_millis(30_000))
            .with_jitter(0.0);
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(8000));
        assert_eq!(policy.delay_for(10), Duration::from_millis(30_000));
        assert_eq!(policy.delay_for(200), Duration::from_millis(30_000));
    }

    #[test]
    fn jittered_delays_are_non_decreasing_and_capped() {
        let policy = RetryPolicy::default().with_jitter(1.0);
        for _ in 0..100 {
            let delays: Vec<Duration> = (1..=12).map(|n| policy.delay_for(n)).collect();
            assert!(delays.windows(2).all(|w| w[0] <= w[1]), "{delays:?}");
            assert!(delays.iter().all(|d| *d <= policy.max_delay));
            assert!(delays[0] >= policy.base_delay);
        }
        // Worst case: maximal jitter on one step, none on the next.
        assert!(policy.delay_with_sample(2, 0.999) <= policy.delay_with_sample(3, 0.0));
    }

    #[test]
    fn state_machine_success_and_fatal() {
        let policy = fast_policy(3);
        let mut tracker = RetryTracker::default();
        let ok = SubmissionOutcome::success(200, "{}".into(), Duration::ZERO);
        assert_eq!(
            RetryController::next(&mut tracker, &policy, &ok),
            Transition::Complete(RetryState::Succeeded)
        );
        assert_eq!(tracker.state, RetryState::Succeeded);

        let mut tracker = RetryTracker::default();
        let fatal = SubmissionOutcome::failed(FailureKind::Unauthorized, "401", Duration::ZERO);
        assert_eq!(
            RetryController::next(&mut tracker, &policy, &fatal),
            Transition::Complete(RetryState::Fatal)
        );
        assert_eq!(tracker.attempts, 1);
    }

    #[test]
    fn zero_retries_makes_one_attempt() {
        let policy = fast_policy(0);
        let mut tracker = RetryTracker::default();
        let outcome = SubmissionOutcome::failed(FailureKind::ServerError, "500", Duration::ZERO);
        assert_eq!(
            RetryController::next(&mut tracker, &policy, &outcome),
            Transition::Complete(RetryState::Exhausted)
        );
        assert!(tracker.delays.is_empty());
        assert_eq!(RetryPolicy::disabled().attempt_budget(), 1);
    }

    #[test]
    fn retry_after_raises_delay_up_to_cap() {
        let policy = fast_policy(5).with_jitter(0.0);
        let mut tracker = RetryTracker::default();
        let outcome = SubmissionOutcome::failed(
            FailureKind::RateLimited {
                retry_after_ms: Some(3),
            },
            "429",
            Duration::ZERO,
        );
        match RetryController::next(&mut tracker, &policy, &outcome) {
            Transition::Retry { delay, .. } => assert_eq!(delay, Duration::from_millis(3)),
            other => panic!("expected retry, got {other:?}"),
        }

        let outcome = SubmissionOutcome::failed(
            FailureKind::RateLimited {
                retry_after_ms: Some(60_000),
            },
            "429",
            Duration::ZERO,
        );
        match RetryController::next(&mut tracker, &policy, &outcome) {
            Transition::Retry { delay, .. } => assert_eq!(delay, policy.max_delay),
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn always_retryable_consumes_exact_budget() {
        for max_retries in 1..=5 {
            let policy = fast_policy(max_retries);
            let (outcome, tracker, calls) =
                run_script(ScriptedTransport::statuses(&[503]), &policy).await;
            assert_eq!(tracker.state, RetryState::Exhausted);
            assert_eq!(tracker.attempts, max_retries);
            assert_eq!(calls, max_retries);
            assert_eq!(outcome.attempt, max_retries);
            assert_eq!(tracker.delays.len() as u32, max_retries - 1);
            assert!(tracker.delays.windows(2).all(|w| w[0] <= w[1]));
            assert!(tracker.delays.iter().all(|d| *d <= policy.max_delay));
        }
    }

    #[tokio::test]
    async fn rate_limited_twice_then_success() {
        let (outcome, tracker, calls) =
            run_script(ScriptedTransport::statuses(&[429, 429, 200]), &fast_policy(3)).await;
        assert!(outcome.is_success());
        assert_eq!(tracker.state, RetryState::Succeeded);
        assert_eq!(tracker.attempts, 3);
        assert_eq!(outcome.attempt, 3);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn fatal_uses_one_attempt() {
        let (outcome, tracker, calls) =
            run_script(ScriptedTransport::statuses(&[401]), &fast_policy(5)).await;
        assert_eq!(tracker.state, RetryState::Fatal);
        assert_eq!(tracker.attempts, 1);
        assert_eq!(calls, 1);
        assert_eq!(outcome.failure, Some(FailureKind::Unauthorized));
    }

    #[tokio::test]
    async fn client_errors_use_one_attempt() {
        for status in [404, 413, 422] {
            let (outcome, tracker, calls) =
                run_script(ScriptedTransport::statuses(&[status]), &fast_policy(5)).await;
            assert_eq!(tracker.state, RetryState::Fatal, "status {status}");
            assert_eq!(calls, 1, "status {status}");
            assert_eq!(outcome.failure, Some(FailureKind::ClientError));
        }
    }

    #[tokio::test]
    async fn transport_fault_retried_once() {
        let (outcome, tracker, calls) = run_script(
            ScriptedTransport::errors(TransportError::Other("boom".into())),
            &fast_policy(10),
        )
        .await;
        assert_eq!(tracker.state, RetryState::Exhausted);
        assert_eq!(calls, 2);
        assert_eq!(outcome.failure, Some(FailureKind::TransportFault));
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let policy = RetryPolicy::default()
            .with_max_retries(5)
            .with_delays(Duration::from_secs(60), Duration::from_secs(60));
        let adapter = TransportAdapter::new(ScriptedTransport::statuses(&[500]));
        let cancel = CancellationSignal::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let (outcome, tracker) = tokio::time::timeout(
            Duration::from_secs(5),
            RetryController::run(&adapter, &policy, &batch(), &SubmitOptions::default(), &cancel),
        )
        .await
        .expect("cancellation should end the backoff");

        assert_eq!(outcome.failure, Some(FailureKind::Cancelled));
        assert_eq!(tracker.state, RetryState::Fatal);
        assert_eq!(tracker.attempts, 1);
    }

    struct StalledTransport;

    impl Transport for StalledTransport {
        async fn send(
            &self,
            _request: &SubmissionRequest<'_>,
        ) -> Result<RawResponse, TransportError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(RawResponse::new(200, "{}"))
        }
    }

    #[tokio::test]
    async fn cancellation_during_exchange_counts_the_attempt() {
        let adapter = TransportAdapter::new(StalledTransport);
        let cancel = CancellationSignal::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let (outcome, tracker) = tokio::time::timeout(
            Duration::from_secs(5),
            RetryController::run(&adapter, &fast_policy(3), &batch(), &SubmitOptions::default(), &cancel),
        )
        .await
        .expect("cancellation should end the exchange");

        assert_eq!(outcome.failure, Some(FailureKind::Cancelled));
        assert_eq!(outcome.attempt, 1);
        assert_eq!(tracker.state, RetryState::Fatal);
        assert_eq!(tracker.attempts, 1);
    }
}
