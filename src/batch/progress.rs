//! Progress delivery
//!
//! The coordinator calls [`ProgressObserver::on_progress`] outside its
//! internal lock, possibly from several workers at once. Observers must
//! return quickly; anything slow belongs behind [`progress_channel`], which
//! never blocks the engine and drops snapshots when its buffer is full.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::trace;

use super::types::BatchExecutionProgress;

/// Receives progress snapshots
pub trait ProgressObserver: Send + Sync {
    /// Called from worker tasks; must not block
    fn on_progress(&self, progress: &BatchExecutionProgress);
}

impl<F> ProgressObserver for F
where
    F: Fn(&BatchExecutionProgress) + Send + Sync,
{
    fn on_progress(&self, progress: &BatchExecutionProgress) {
        self(progress)
    }
}

/// Stream side of [`progress_channel`]
pub type ProgressStream = ReceiverStream<BatchExecutionProgress>;

/// Best-effort observer that forwards snapshots into a bounded channel
#[derive(Debug, Clone)]
pub struct ChannelProgressObserver {
    sender: mpsc::Sender<BatchExecutionProgress>,
    dropped: Arc<AtomicU64>,
}

impl ChannelProgressObserver {
    /// Snapshots discarded because the buffer was full or the stream was dropped
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl ProgressObserver for ChannelProgressObserver {
    fn on_progress(&self, progress: &BatchExecutionProgress) {
        if self.sender.try_send(progress.clone()).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(sequence = progress.sequence, "Progress snapshot dropped");
        }
    }
}

/// Create a bounded progress channel
///
/// The stream ends once the observer and all its clones are dropped.
pub fn progress_channel(capacity: usize) -> (ChannelProgressObserver, ProgressStream) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let observer = ChannelProgressObserver {
        sender,
        dropped: Arc::new(AtomicU64::new(0)),
    };
    (observer, ReceiverStream::new(receiver))
}
