//! Batch-wide cancellation signal
//!
//! One signal is shared by the coordinator, every worker and every in-flight
//! provider call. Cancelling is idempotent and race-free: concurrent callers
//! may all invoke [`CancellationSignal::cancel_with`], but only the first
//! reason is recorded.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// Why a batch stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelReason {
    /// Cancelled by the caller
    External,
    /// The batch deadline expired
    Timeout,
    /// An item failed with `continue_on_error` disabled
    FailFast,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::External => write!(f, "cancelled by caller"),
            CancelReason::Timeout => write!(f, "batch timeout expired"),
            CancelReason::FailFast => write!(f, "aborted after a failed item"),
        }
    }
}

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    reason: OnceLock<CancelReason>,
    notify: Notify,
}

/// Cloneable cancellation handle
#[derive(Clone, Default)]
pub struct CancellationSignal {
    inner: Arc<Inner>,
}

impl fmt::Debug for CancellationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationSignal")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

impl CancellationSignal {
    /// Fresh, uncancelled signal
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel on behalf of the caller
    pub fn cancel(&self) {
        self.cancel_with(CancelReason::External);
    }

    /// Returns `true` if this call was the one that cancelled the signal
    pub fn cancel_with(&self, reason: CancelReason) -> bool {
        let won = self.inner.reason.set(reason).is_ok();
        if won {
            self.inner.cancelled.store(true, Ordering::SeqCst);
            self.inner.notify.notify_waiters();
        }
        won
    }

    /// Whether any cancellation has happened
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// The reason recorded by the first cancellation
    pub fn reason(&self) -> Option<CancelReason> {
        self.inner.reason.get().copied()
    }

    /// Resolves once the signal is cancelled
    pub async fn cancelled(&self) {
        loop {
            // Register interest before checking the flag so a concurrent
            // `cancel_with` cannot slip between the check and the await.
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
