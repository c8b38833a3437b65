//! Concurrent batch execution
//!
//! The [`BatchCoordinator`] drives many template resolutions against the
//! registered providers with bounded concurrency, retry with backoff,
//! provider distribution, partial-failure tolerance and progress reporting.

pub mod cancellation;
pub mod error_handling;
pub mod executor;
pub mod metrics;
mod persistence;
pub mod progress;
pub mod retry;
mod scheduler;
pub mod types;

pub use cancellation::{CancelReason, CancellationSignal};
pub use error_handling::{FailureClass, FailureInfo};
pub use executor::{BatchCoordinator, CsvBatchExecution};
pub use metrics::gather_metrics;
pub use progress::{progress_channel, ChannelProgressObserver, ProgressObserver, ProgressStream};
pub use retry::{BackoffRetryPolicy, RetryDecision, RetryOptions, RetryPolicy};
pub use types::*;
