//! Run-level cancellation.
//!
//! A [`CancellationSignal`] is created per run and cloned into every lane.
//! Firing it wakes all pending waits; lanes then resolve their batch as
//! cancelled instead of hanging on the network or a backoff sleep.
//!
//! Long-lived signals (Ctrl+C, an engine's external handle) are linked to a
//! fresh run signal with [`CancellationSignal::child`], so a run timeout never
//! leaks into later runs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cloneable handle to a run's cancellation state.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    inner: Arc<Inner>,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Wakes every waiter exactly once.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation is requested. Returns immediately if it
    /// already was.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a concurrent `cancel()` cannot
        // slip between the check and the wait.
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }

    /// A new signal that fires whenever this one does. Cancelling the child
    /// leaves this signal untouched. The link lasts until the guard drops.
    pub fn child(&self) -> (CancellationSignal, SignalGuard) {
        let child = CancellationSignal::new();
        if self.is_cancelled() {
            child.cancel();
        }
        let parent = self.clone();
        let linked = child.clone();
        let handle = tokio::spawn(async move {
            parent.cancelled().await;
            linked.cancel();
        });
        (child, SignalGuard { handle })
    }

    /// Fire this signal after `timeout` unless the returned guard is dropped
    /// first.
    pub fn cancel_after(&self, timeout: Duration) -> SignalGuard {
        let signal = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            tracing::warn!(timeout_ms = timeout.as_millis() as u64, "Run timeout reached, cancelling");
            signal.cancel();
        });
        SignalGuard { handle }
    }
}

/// Aborts the background task behind a timeout or a parent link on drop.
#[derive(Debug)]
pub struct SignalGuard {
    handle: JoinHandle<()>,
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
