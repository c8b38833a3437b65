//! Background writer for execution records
//!
//! Workers hand terminal attempts to a single writer task and move on, so a
//! slow or stuck [`ExecutionStore`] never holds a worker slot. The coordinator
//! flushes the writer once the batch is done, waiting no longer than the
//! batch deadline; anything still queued after that keeps being written in the
//! background.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::types::{BatchJobRecord, ExecutionAttempt};
use crate::store::ExecutionStore;

enum Record {
    Attempt(ExecutionAttempt),
    Batch(BatchJobRecord),
}

pub(crate) struct Persister {
    sender: Mutex<Option<mpsc::UnboundedSender<Record>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    failures: Arc<AtomicUsize>,
}

impl Persister {
    /// Start the writer task; without a store every record is dropped
    pub fn spawn(store: Option<Arc<dyn ExecutionStore>>) -> Self {
        let failures = Arc::new(AtomicUsize::new(0));
        let Some(store) = store else {
            return Self {
                sender: Mutex::new(None),
                writer: Mutex::new(None),
                failures,
            };
        };

        let (sender, mut receiver) = mpsc::unbounded_channel();
        let counter = failures.clone();
        let writer = tokio::spawn(async move {
            while let Some(record) = receiver.recv().await {
                match record {
                    Record::Attempt(attempt) => {
                        if let Err(e) = store.record_attempt(&attempt).await {
                            counter.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                batch_id = %attempt.batch_id,
                                request_index = attempt.request_index,
                                error = %e,
                                "Failed to persist attempt"
                            );
                        }
                    }
                    Record::Batch(record) => {
                        if let Err(e) = store.record_batch(&record).await {
                            counter.fetch_add(1, Ordering::Relaxed);
                            warn!(batch_id = %record.batch_id, error = %e, "Failed to persist batch record");
                        }
                    }
                }
            }
        });

        Self {
            sender: Mutex::new(Some(sender)),
            writer: Mutex::new(Some(writer)),
            failures,
        }
    }

    pub fn attempt(&self, attempt: &ExecutionAttempt) {
        self.send(Record::Attempt(attempt.clone()));
    }

    pub fn batch(&self, record: BatchJobRecord) {
        self.send(Record::Batch(record));
    }

    fn send(&self, record: Record) {
        if let Some(sender) = self.sender.lock().as_ref() {
            // The writer only stops once the sender is dropped.
            let _ = sender.send(record);
        }
    }

    /// Writes that returned an error so far
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }

    /// Stop accepting records and wait for the queue to drain
    ///
    /// Returns `false` when `deadline` passed first; the writer then keeps
    /// running detached.
    pub async fn flush(&self, deadline: Option<Instant>) -> bool {
        self.sender.lock().take();
        let writer = self.writer.lock().take();
        let Some(mut writer) = writer else {
            return true;
        };

        let joined = match deadline {
            Some(at) => match tokio::time::timeout_at(at, &mut writer).await {
                Ok(joined) => joined,
                Err(_) => {
                    warn!("Execution store still writing at the batch deadline, continuing in background");
                    return false;
                }
            },
            None => writer.await,
        };
        if let Err(e) = joined {
            warn!(error = %e, "Execution store writer stopped unexpectedly");
        }
        debug!("Execution records flushed");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{ItemError, ItemErrorKind};
    use crate::store::{ExecutionHistory, InMemoryExecutionStore, StoreError};
    use async_trait::async_trait;
    use std::time::Duration;
    use uuid::Uuid;

    struct Stuck;

    #[async_trait]
    impl ExecutionStore for Stuck {
        async fn record_attempt(&self, _attempt: &ExecutionAttempt) -> Result<(), StoreError> {
            std::future::pending().await
        }

        async fn record_batch(&self, _record: &BatchJobRecord) -> Result<(), StoreError> {
            std::future::pending().await
        }
    }

    fn rejected(batch_id: Uuid, index: usize) -> ExecutionAttempt {
        ExecutionAttempt::rejected(
            batch_id,
            index,
            ItemError {
                kind: ItemErrorKind::Validation,
                code: "missing".to_string(),
                message: "name is required".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_flush_drains_queued_writes() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let persister = Persister::spawn(Some(store.clone() as Arc<dyn ExecutionStore>));
        let batch_id = Uuid::new_v4();
        persister.attempt(&rejected(batch_id, 0));
        persister.attempt(&rejected(batch_id, 1));

        assert!(persister.flush(None).await);
        assert_eq!(store.attempts_for(batch_id).await.len(), 2);
        assert_eq!(persister.failures(), 0);
    }

    #[tokio::test]
    async fn test_stuck_store_does_not_block_senders_or_flush_past_deadline() {
        let persister = Persister::spawn(Some(Arc::new(Stuck) as Arc<dyn ExecutionStore>));
        for index in 0..3 {
            persister.attempt(&rejected(Uuid::new_v4(), index));
        }

        let started = Instant::now();
        let drained = persister
            .flush(Some(Instant::now() + Duration::from_millis(50)))
            .await;
        assert!(!drained);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_without_store_everything_is_dropped() {
        let persister = Persister::spawn(None);
        persister.attempt(&rejected(Uuid::new_v4(), 0));
        assert!(persister.flush(None).await);
        assert_eq!(persister.failures(), 0);
    }
}
