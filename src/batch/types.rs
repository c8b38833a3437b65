//! Batch data model
//!
//! Options going in, attempts and progress while running, and the aggregated
//! result coming out.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::progress::{progress_channel, ChannelProgressObserver, ProgressStream};
use super::retry::RetryOptions;
use crate::provider::{DistributionStrategy, ProviderResponse};
use crate::template::ResolvedPrompt;
use crate::value::Metadata;
use crate::{PromptRunError, Result};

/// Options for every provider call made on behalf of one item
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelExecutionOptions {
    /// Model name passed through to the provider
    pub model: Option<String>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Completion length limit
    pub max_tokens: Option<u32>,
    /// Bound on a single provider call; expiry is a transient failure
    pub timeout: Option<Duration>,
    /// Retry settings for failed calls
    pub retry: RetryOptions,
    /// Passed through to the provider untouched
    pub metadata: Metadata,
}

impl ModelExecutionOptions {
    /// Set the model name
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the sampling temperature
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the completion length limit
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Bound each provider call
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the retry settings
    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }
}

/// Options for a whole batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchModelExecutionOptions {
    /// Provider calls allowed in flight at once
    pub max_concurrency: usize,
    /// Keep running other items after one fails for good
    pub continue_on_error: bool,
    /// Wall-clock deadline for the whole batch
    pub batch_timeout: Option<Duration>,
    /// How calls are spread over providers
    pub distribution_strategy: DistributionStrategy,
    /// Options applied to every provider call
    pub execution: ModelExecutionOptions,
    /// Seeds random distribution and retry jitter
    pub random_seed: Option<u64>,
    /// Capacity of the channel built by [`progress_channel`](Self::progress_channel)
    pub progress_buffer: usize,
}

impl Default for BatchModelExecutionOptions {
    fn default() -> Self {
        Self {
            max_concurrency: num_cpus::get(),
            continue_on_error: true,
            batch_timeout: None,
            distribution_strategy: DistributionStrategy::default(),
            execution: ModelExecutionOptions::default(),
            random_seed: None,
            progress_buffer: 256,
        }
    }
}

impl BatchModelExecutionOptions {
    /// Set the worker pool size
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Set fail-fast (`false`) or tolerant (`true`) behaviour
    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    /// Bound the whole batch
    pub fn with_batch_timeout(mut self, timeout: Duration) -> Self {
        self.batch_timeout = Some(timeout);
        self
    }

    /// Set the distribution strategy
    pub fn with_strategy(mut self, strategy: DistributionStrategy) -> Self {
        self.distribution_strategy = strategy;
        self
    }

    /// Replace the per-call options
    pub fn with_execution(mut self, execution: ModelExecutionOptions) -> Self {
        self.execution = execution;
        self
    }

    /// Shorthand for setting `execution.retry`
    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.execution.retry = retry;
        self
    }

    /// Make random selection and jitter reproducible
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self
    }

    /// Set the progress channel capacity
    pub fn with_progress_buffer(mut self, capacity: usize) -> Self {
        self.progress_buffer = capacity;
        self
    }

    /// Progress observer and stream sized by `progress_buffer`
    ///
    /// Snapshots that arrive while the buffer is full are dropped and counted
    /// by [`ChannelProgressObserver::dropped`].
    pub fn progress_channel(&self) -> (ChannelProgressObserver, ProgressStream) {
        progress_channel(self.progress_buffer)
    }

    /// Checked by the coordinator before anything is dispatched
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(PromptRunError::Configuration(
                "max_concurrency must be at least 1".into(),
            ));
        }
        if self.progress_buffer == 0 {
            return Err(PromptRunError::Configuration(
                "progress_buffer must be at least 1".into(),
            ));
        }
        if self.batch_timeout.is_some_and(|t| t.is_zero()) {
            return Err(PromptRunError::Configuration(
                "batch_timeout must be greater than zero".into(),
            ));
        }
        if self.execution.timeout.is_some_and(|t| t.is_zero()) {
            return Err(PromptRunError::Configuration(
                "per-call timeout must be greater than zero".into(),
            ));
        }
        self.execution.retry.validate()
    }
}

/// Lifecycle of one item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttemptStatus {
    /// Not yet dispatched
    Pending,
    /// A provider call is in flight
    Running,
    /// Finished with a successful response
    Succeeded,
    /// Failed for good
    Failed,
    /// Waiting out a backoff delay
    Retrying,
    /// Stopped before it could finish
    Cancelled,
}

impl AttemptStatus {
    /// Succeeded, failed or cancelled
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AttemptStatus::Succeeded | AttemptStatus::Failed | AttemptStatus::Cancelled
        )
    }

    /// Lowercase name used in logs and records
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Pending => "pending",
            AttemptStatus::Running => "running",
            AttemptStatus::Succeeded => "succeeded",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Retrying => "retrying",
            AttemptStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error categories reported per item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemErrorKind {
    /// The value set was rejected before dispatch
    Validation,
    /// A provider failure that could have been retried
    TransientProvider,
    /// A provider failure that is never retried
    PermanentProvider,
    /// No provider could be selected
    NoProviderAvailable,
    /// The batch deadline expired before the item finished
    Timeout,
    /// The batch was cancelled or aborted
    Cancelled,
}

/// Why an item did not succeed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemError {
    /// Error category
    pub kind: ItemErrorKind,
    /// Stable code, for example `missing` or `rate_limited`
    pub code: String,
    /// Human-readable detail
    pub message: String,
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} [{}]: {}", self.kind, self.code, self.message)
    }
}

/// One item's pairing of a resolved prompt with providers, across all its attempts
///
/// Handed to the execution store only once terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    /// Batch the item belongs to
    pub batch_id: Uuid,
    /// Position of the value set in the input
    pub request_index: usize,
    /// Absent when the value set failed validation
    pub resolved: Option<ResolvedPrompt>,
    /// Provider of the latest call
    pub provider_id: Option<String>,
    /// Current lifecycle state
    pub status: AttemptStatus,
    /// Provider calls issued
    pub attempt_count: u32,
    /// Retries scheduled so far
    pub retry_count: u32,
    /// First dispatch
    pub started_at: Option<DateTime<Utc>>,
    /// Set once terminal
    pub finished_at: Option<DateTime<Utc>>,
    /// Latest provider response
    pub response: Option<ProviderResponse>,
    /// Error of the latest failed attempt
    pub error: Option<ItemError>,
}

impl ExecutionAttempt {
    /// Resolved and waiting for dispatch
    pub fn pending(batch_id: Uuid, request_index: usize, resolved: ResolvedPrompt) -> Self {
        Self {
            batch_id,
            request_index,
            resolved: Some(resolved),
            provider_id: None,
            status: AttemptStatus::Pending,
            attempt_count: 0,
            retry_count: 0,
            started_at: None,
            finished_at: None,
            response: None,
            error: None,
        }
    }

    /// An item rejected before dispatch
    pub fn rejected(batch_id: Uuid, request_index: usize, error: ItemError) -> Self {
        let now = Utc::now();
        Self {
            batch_id,
            request_index,
            resolved: None,
            provider_id: None,
            status: AttemptStatus::Failed,
            attempt_count: 0,
            retry_count: 0,
            started_at: Some(now),
            finished_at: Some(now),
            response: None,
            error: Some(error),
        }
    }

    /// Whether the item reached its final state
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock time from first dispatch to the terminal state
    pub fn duration(&self) -> Duration {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => (end - start).to_std().unwrap_or_default(),
            _ => Duration::ZERO,
        }
    }
}

/// Aggregate counters
///
/// `completed == succeeded + failed + skipped` and `completed <= total` hold at
/// every observable point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounters {
    /// Items in the batch
    pub total: usize,
    /// Items in a terminal state
    pub completed: usize,
    /// Items that succeeded
    pub succeeded: usize,
    /// Items that failed for good
    pub failed: usize,
    /// Cancelled items
    pub skipped: usize,
}

impl BatchCounters {
    /// Counters for a batch of `total` items
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    /// Count one item reaching `status`; non-terminal statuses are ignored
    pub fn record(&mut self, status: AttemptStatus) {
        let slot = match status {
            AttemptStatus::Succeeded => &mut self.succeeded,
            AttemptStatus::Failed => &mut self.failed,
            AttemptStatus::Cancelled => &mut self.skipped,
            _ => return,
        };
        *slot += 1;
        self.completed += 1;
    }

    /// Items not yet terminal
    pub fn remaining(&self) -> usize {
        self.total - self.completed
    }

    /// Whether the counter invariants hold
    pub fn is_consistent(&self) -> bool {
        self.completed == self.succeeded + self.failed + self.skipped && self.completed <= self.total
    }
}

/// Progress snapshot handed to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchExecutionProgress {
    /// Batch this snapshot describes
    pub batch_id: Uuid,
    /// Increases by one per snapshot; deliveries may arrive out of order
    pub sequence: u64,
    /// Items in the batch
    pub total_requests: usize,
    /// Items in a terminal state
    pub completed_requests: usize,
    /// Items that succeeded
    pub successful_requests: usize,
    /// Items that failed for good
    pub failed_requests: usize,
    /// Items that were cancelled
    pub skipped_requests: usize,
    /// Time since the batch started
    pub elapsed: Duration,
    /// Linear extrapolation from the items completed so far
    pub estimated_time_remaining: Option<Duration>,
}

impl BatchExecutionProgress {
    /// Snapshot of `counters` at `elapsed`
    pub fn from_counters(batch_id: Uuid, sequence: u64, counters: &BatchCounters, elapsed: Duration) -> Self {
        let estimated_time_remaining = match counters.completed {
            0 => None,
            done if done >= counters.total => Some(Duration::ZERO),
            done => {
                let per_item = elapsed.as_secs_f64() / done as f64;
                Some(Duration::from_secs_f64(per_item * counters.remaining() as f64))
            }
        };
        Self {
            batch_id,
            sequence,
            total_requests: counters.total,
            completed_requests: counters.completed,
            successful_requests: counters.succeeded,
            failed_requests: counters.failed,
            skipped_requests: counters.skipped,
            elapsed,
            estimated_time_remaining,
        }
    }

    /// 0 to 100; an empty batch is complete
    pub fn percent_complete(&self) -> f64 {
        if self.total_requests == 0 {
            100.0
        } else {
            self.completed_requests as f64 * 100.0 / self.total_requests as f64
        }
    }
}

/// Final outcome for one input item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchItemResult {
    /// Position of the value set in the input
    pub request_index: usize,
    /// Shorthand for `status == Succeeded`
    pub success: bool,
    /// Terminal status
    pub status: AttemptStatus,
    /// Response text, only for successful items
    pub content: Option<String>,
    /// Why the item did not succeed
    pub error: Option<ItemError>,
    /// Provider of the last call, if any call was made
    pub provider_id: Option<String>,
    /// From first dispatch to the terminal state
    pub duration: Duration,
    /// Provider calls issued
    pub attempts: u32,
    /// Retries scheduled
    pub retry_count: u32,
    /// Tokens reported by the final response
    pub tokens_used: u64,
    /// Cost reported by the final response
    pub cost: Option<f64>,
    /// Hash of the resolved prompt
    pub content_hash: Option<String>,
}

impl From<&ExecutionAttempt> for BatchItemResult {
    fn from(attempt: &ExecutionAttempt) -> Self {
        let response = attempt.response.as_ref();
        let success = attempt.status == AttemptStatus::Succeeded;
        Self {
            request_index: attempt.request_index,
            success,
            status: attempt.status,
            content: response.filter(|_| success).and_then(|r| r.content.clone()),
            error: attempt.error.clone(),
            provider_id: attempt.provider_id.clone(),
            duration: attempt.duration(),
            attempts: attempt.attempt_count,
            retry_count: attempt.retry_count,
            tokens_used: response.map(|r| r.tokens_used).unwrap_or(0),
            cost: response.and_then(|r| r.cost_estimate),
            content_hash: attempt.resolved.as_ref().map(|p| p.content_hash.clone()),
        }
    }
}

/// Calls a provider served during one batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderUsage {
    /// Registered provider id
    pub provider_id: String,
    /// Calls issued
    pub requests: u64,
    /// Calls that succeeded
    pub successes: u64,
    /// Calls that failed
    pub failures: u64,
    /// Summed call latency
    pub total_duration: Duration,
    /// Mean call latency
    pub average_duration: Duration,
}

impl ProviderUsage {
    /// Empty usage for `provider_id`
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            ..Default::default()
        }
    }

    /// Account one finished call
    pub fn record(&mut self, success: bool, duration: Duration) {
        self.requests += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.total_duration += duration;
        self.average_duration = self.total_duration / self.requests as u32;
    }
}

/// Batch-level figures
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchStatistics {
    /// Mean duration of items that reached a provider
    pub average_duration: Duration,
    /// Tokens summed over final responses
    pub total_tokens: u64,
    /// Sum of reported costs; `None` if no call reported one
    pub total_cost: Option<f64>,
    /// Completed items per second
    pub throughput: f64,
    /// Wall-clock time of the whole batch
    pub elapsed: Duration,
    /// Execution store writes that failed
    pub store_failures: usize,
}

/// Terminal classification of a whole batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    /// Every item succeeded
    Completed,
    /// Every item reached its own terminal state, some failed
    CompletedWithFailures,
    /// Stopped after a failure with `continue_on_error` disabled
    Aborted,
    /// The batch deadline expired
    TimedOut,
    /// Cancelled by the caller
    Cancelled,
}

/// Everything a batch produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchExecutionResult {
    /// Unique id of this run
    pub batch_id: Uuid,
    /// Template the batch resolved
    pub template_id: String,
    /// How the batch ended
    pub status: BatchStatus,
    /// Distribution strategy in effect
    pub strategy: DistributionStrategy,
    /// One entry per input item, ordered by `request_index`
    pub results: Vec<BatchItemResult>,
    /// Final counters
    pub counters: BatchCounters,
    /// Per-provider figures, in registration order
    pub provider_usage: Vec<ProviderUsage>,
    /// Timing, token and cost figures
    pub statistics: BatchStatistics,
    /// When the batch was accepted
    pub started_at: DateTime<Utc>,
    /// When the result was assembled
    pub finished_at: DateTime<Utc>,
}

impl BatchExecutionResult {
    /// Items that succeeded
    pub fn successful(&self) -> impl Iterator<Item = &BatchItemResult> {
        self.results.iter().filter(|r| r.success)
    }

    /// Items that failed for good; cancelled items are not included
    pub fn failed(&self) -> impl Iterator<Item = &BatchItemResult> {
        self.results.iter().filter(|r| r.status == AttemptStatus::Failed)
    }

    /// Usage figures for one provider
    pub fn usage_for(&self, provider_id: &str) -> Option<&ProviderUsage> {
        self.provider_usage.iter().find(|u| u.provider_id == provider_id)
    }
}

/// Summary row persisted for a finished batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJobRecord {
    /// Unique id of the run
    pub batch_id: Uuid,
    /// Template the batch resolved
    pub template_id: String,
    /// Distribution strategy in effect
    pub strategy: DistributionStrategy,
    /// How the batch ended
    pub status: BatchStatus,
    /// Final counters
    pub counters: BatchCounters,
    /// Timing, token and cost figures
    pub statistics: BatchStatistics,
    /// When the batch was accepted
    pub started_at: DateTime<Utc>,
    /// When the result was assembled
    pub finished_at: DateTime<Utc>,
}

impl From<&BatchExecutionResult> for BatchJobRecord {
    fn from(result: &BatchExecutionResult) -> Self {
        Self {
            batch_id: result.batch_id,
            template_id: result.template_id.clone(),
            strategy: result.strategy,
            status: result.status,
            counters: result.counters,
            statistics: result.statistics.clone(),
            started_at: result.started_at,
            finished_at: result.finished_at,
        }
    }
}
