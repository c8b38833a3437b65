//! Work queue and shared batch state
//!
//! Workers pull request indices from a FIFO queue. Every state change of an
//! item goes through [`BatchTracker`], which holds the attempts and the
//! aggregate counters under one mutex, so counters observed by progress
//! observers always add up. Snapshots are built inside the lock and delivered
//! after it is released.
//!
//! The queue closes itself once no dispatchable item is left, which is how
//! idle workers learn that the batch is done. Items waiting out a retry delay
//! still count as outstanding.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use uuid::Uuid;

use super::cancellation::CancellationSignal;
use super::metrics;
use super::progress::ProgressObserver;
use super::types::{
    AttemptStatus, BatchCounters, BatchExecutionProgress, ExecutionAttempt, ItemError,
    ItemErrorKind, ProviderUsage,
};
use crate::provider::ProviderResponse;

/// FIFO of request indices ready for dispatch
struct WorkQueue {
    sender: Mutex<Option<mpsc::UnboundedSender<usize>>>,
    receiver: AsyncMutex<mpsc::UnboundedReceiver<usize>>,
}

impl WorkQueue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: AsyncMutex::new(receiver),
        }
    }

    fn push(&self, index: usize) -> bool {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(index).is_ok(),
            None => false,
        }
    }

    fn close(&self) {
        self.sender.lock().take();
    }

    /// `None` once the queue is closed and drained
    async fn pop(&self) -> Option<usize> {
        self.receiver.lock().await.recv().await
    }
}

struct BatchState {
    slots: Vec<ExecutionAttempt>,
    counters: BatchCounters,
    usage: Vec<ProviderUsage>,
    sequence: u64,
    /// Dispatchable items not yet terminal
    outstanding: usize,
    /// Set by the final sweep; later mutations are ignored
    finalized: bool,
}

/// What a worker needs to issue one call
#[derive(Debug, Clone)]
pub(crate) struct Dispatch {
    pub prompt: String,
    /// 1-based number of this try
    pub attempt: u32,
}

/// Everything the tracker holds once the batch has stopped
#[derive(Debug, Clone)]
pub(crate) struct FinalState {
    pub attempts: Vec<ExecutionAttempt>,
    pub counters: BatchCounters,
    pub usage: Vec<ProviderUsage>,
}

/// Shared state of one running batch
pub(crate) struct BatchTracker {
    batch_id: Uuid,
    started: Instant,
    queue: WorkQueue,
    state: Mutex<BatchState>,
    observer: Option<Arc<dyn ProgressObserver>>,
}

impl BatchTracker {
    /// Pending slots are queued in index order; terminal slots (rejected
    /// before dispatch) are counted right away.
    pub fn new(
        batch_id: Uuid,
        slots: Vec<ExecutionAttempt>,
        provider_ids: Vec<String>,
        observer: Option<Arc<dyn ProgressObserver>>,
    ) -> Self {
        let started = Instant::now();
        let queue = WorkQueue::new();
        let mut counters = BatchCounters::new(slots.len());
        let mut snapshots = Vec::new();
        let mut sequence = 0;
        let mut outstanding = 0;

        for slot in &slots {
            if slot.is_terminal() {
                counters.record(slot.status);
                metrics::record_item(slot.status);
                sequence += 1;
                snapshots.push(BatchExecutionProgress::from_counters(
                    batch_id,
                    sequence,
                    &counters,
                    started.elapsed(),
                ));
            } else {
                queue.push(slot.request_index);
                outstanding += 1;
            }
        }
        if outstanding == 0 {
            queue.close();
        }

        let tracker = Self {
            batch_id,
            started,
            queue,
            state: Mutex::new(BatchState {
                slots,
                counters,
                usage: provider_ids.into_iter().map(ProviderUsage::new).collect(),
                sequence,
                outstanding,
                finalized: false,
            }),
            observer,
        };
        tracker.emit(snapshots);
        tracker
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    #[cfg(test)]
    pub fn counters(&self) -> BatchCounters {
        self.state.lock().counters
    }

    /// Next index to dispatch; `None` when the queue is done or the batch is cancelled
    pub async fn next(&self, signal: &CancellationSignal) -> Option<usize> {
        tokio::select! {
            biased;
            _ = signal.cancelled() => None,
            index = self.queue.pop() => index.filter(|_| !signal.is_cancelled()),
        }
    }

    /// Put an item back after its retry delay
    pub fn requeue(&self, index: usize) -> bool {
        if self.state.lock().finalized {
            return false;
        }
        self.queue.push(index)
    }

    pub fn begin(&self, index: usize) -> Option<Dispatch> {
        let mut state = self.state.lock();
        if state.finalized {
            return None;
        }
        let slot = state.slots.get_mut(index)?;
        if slot.is_terminal() {
            return None;
        }
        slot.started_at.get_or_insert_with(Utc::now);
        let prompt = slot.resolved.as_ref()?.text.clone();
        Some(Dispatch {
            prompt,
            attempt: slot.retry_count + 1,
        })
    }

    pub fn mark_running(&self, index: usize, provider_id: &str) -> bool {
        let mut state = self.state.lock();
        if state.finalized {
            return false;
        }
        match state.slots.get_mut(index) {
            Some(slot) if !slot.is_terminal() => {
                slot.status = AttemptStatus::Running;
                slot.provider_id = Some(provider_id.to_string());
                slot.attempt_count += 1;
                true
            }
            _ => false,
        }
    }

    pub fn mark_retrying(&self, index: usize, error: ItemError, response: Option<ProviderResponse>) -> bool {
        let mut state = self.state.lock();
        if state.finalized {
            return false;
        }
        match state.slots.get_mut(index) {
            Some(slot) if !slot.is_terminal() => {
                slot.status = AttemptStatus::Retrying;
                slot.retry_count += 1;
                slot.error = Some(error);
                slot.response = response;
                true
            }
            _ => false,
        }
    }

    /// Per-provider usage for one completed call
    pub fn record_call(&self, provider_id: &str, success: bool, duration: Duration) {
        let mut state = self.state.lock();
        match state.usage.iter_mut().find(|u| u.provider_id == provider_id) {
            Some(usage) => usage.record(success, duration),
            None => {
                let mut usage = ProviderUsage::new(provider_id);
                usage.record(success, duration);
                state.usage.push(usage);
            }
        }
    }

    /// Move an item to a terminal state
    ///
    /// Returns the terminal attempt, or `None` if the item was already
    /// terminal or the batch has been finalized.
    pub fn finish(
        &self,
        index: usize,
        status: AttemptStatus,
        response: Option<ProviderResponse>,
        error: Option<ItemError>,
    ) -> Option<ExecutionAttempt> {
        let (attempt, snapshot) = {
            let mut state = self.state.lock();
            if state.finalized {
                return None;
            }
            let slot = state.slots.get_mut(index)?;
            if slot.is_terminal() {
                return None;
            }
            slot.status = status;
            slot.finished_at = Some(Utc::now());
            if response.is_some() {
                slot.response = response;
            }
            slot.error = error;
            let attempt = slot.clone();

            state.counters.record(status);
            state.outstanding = state.outstanding.saturating_sub(1);
            if state.outstanding == 0 {
                self.queue.close();
            }
            (attempt, self.next_snapshot(&mut state))
        };

        metrics::record_item(status);
        self.emit(vec![snapshot]);
        Some(attempt)
    }

    /// Cancel every non-terminal item and freeze the batch
    ///
    /// Safe to call more than once; only the first call sweeps.
    pub fn cancel_remaining(&self, kind: ItemErrorKind, message: &str) -> Vec<ExecutionAttempt> {
        let code = match kind {
            ItemErrorKind::Timeout => "batch_timeout",
            _ => "cancelled",
        };
        let (swept, snapshots) = {
            let mut state = self.state.lock();
            if state.finalized {
                return Vec::new();
            }
            let now = Utc::now();
            let mut swept = Vec::new();
            let mut snapshots = Vec::new();
            for i in 0..state.slots.len() {
                let slot = &mut state.slots[i];
                if slot.is_terminal() {
                    continue;
                }
                slot.status = AttemptStatus::Cancelled;
                slot.finished_at = Some(now);
                slot.error = Some(ItemError {
                    kind,
                    code: code.to_string(),
                    message: message.to_string(),
                });
                swept.push(slot.clone());
                state.counters.record(AttemptStatus::Cancelled);
                snapshots.push(self.next_snapshot(&mut state));
            }
            state.outstanding = 0;
            state.finalized = true;
            self.queue.close();
            (swept, snapshots)
        };

        for _ in &swept {
            metrics::record_item(AttemptStatus::Cancelled);
        }
        self.emit(snapshots);
        swept
    }

    pub fn final_state(&self) -> FinalState {
        let mut state = self.state.lock();
        state.finalized = true;
        FinalState {
            attempts: state.slots.clone(),
            counters: state.counters,
            usage: state.usage.clone(),
        }
    }

    fn next_snapshot(&self, state: &mut BatchState) -> BatchExecutionProgress {
        state.sequence += 1;
        BatchExecutionProgress::from_counters(
            self.batch_id,
            state.sequence,
            &state.counters,
            self.started.elapsed(),
        )
    }

    fn emit(&self, snapshots: Vec<BatchExecutionProgress>) {
        if let Some(observer) = &self.observer {
            for snapshot in &snapshots {
                observer.on_progress(snapshot);
            }
        }
    }
}
