//! Batch execution coordinator
//!
//! [`BatchCoordinator`] turns one template plus many value sets into provider
//! calls:
//!
//! 1. Every value set is validated and resolved before anything is
//!    dispatched. Rejected sets become failed items without touching a
//!    provider.
//! 2. A fixed pool of `max_concurrency` workers drains the queue. Each worker
//!    picks a provider from the live health snapshot, issues one call at a
//!    time and reports the outcome back to the health tracker.
//! 3. Transient failures are re-queued after the retry delay without holding
//!    a worker. Permanent failures and exhausted budgets are final.
//! 4. Cancellation (caller, batch deadline, or fail-fast) stops dispatch,
//!    abandons in-flight calls and marks every unfinished item cancelled.
//! 5. Terminal attempts are handed to a background writer, so the execution
//!    store never holds up a worker. A provider that panics fails only the
//!    item it was called for.
//!
//! Per-item failures never surface as `Err`; only configuration and template
//! problems found before dispatch do.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::cancellation::{CancelReason, CancellationSignal};
use super::error_handling::FailureInfo;
use super::metrics::{self, CallOutcome};
use super::persistence::Persister;
use super::progress::ProgressObserver;
use super::retry::{BackoffRetryPolicy, RetryDecision, RetryPolicy};
use super::scheduler::BatchTracker;
use super::types::{
    AttemptStatus, BatchCounters, BatchExecutionResult, BatchItemResult, BatchJobRecord,
    BatchModelExecutionOptions, BatchStatistics, BatchStatus, ExecutionAttempt, ItemError,
    ItemErrorKind, ModelExecutionOptions,
};
use crate::provider::{
    DistributionSelector, ObservedOutcome, ProviderClient, ProviderObservation, ProviderRegistry,
    ProviderResponse, StrategySelector,
};
use crate::store::{ExecutionStore, TemplateStore};
use crate::tabular::{parse_for_template, CsvParseOptions, ParsedRows};
use crate::template::{
    Resolver, TemplateDefinition, TemplateError, TemplateResolver, ValidationOutcome, Validator,
    VariableValidator, VariableValueSet,
};
use crate::{PromptRunError, Result};

/// How long cancelled workers get to wind down before they are aborted
const WORKER_STOP_GRACE: Duration = Duration::from_secs(1);

/// Minimum time given to the execution store to catch up after a deadline
const STORE_FLUSH_GRACE: Duration = Duration::from_millis(250);

/// Output of [`BatchCoordinator::execute_csv`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CsvBatchExecution {
    /// Parser output, including rows that were not executed
    pub parsed: ParsedRows,
    /// Outcome of the executed rows; `request_index` maps through `parsed.row_indices`
    pub result: BatchExecutionResult,
}

impl CsvBatchExecution {
    /// CSV data row that produced the item at `request_index`
    pub fn source_row(&self, request_index: usize) -> Option<usize> {
        self.parsed.row_indices.get(request_index).copied()
    }
}

/// Runs batches of resolved prompts against registered providers
pub struct BatchCoordinator {
    registry: Arc<ProviderRegistry>,
    validator: Arc<dyn Validator>,
    resolver: Arc<dyn Resolver>,
    template_store: Option<Arc<dyn TemplateStore>>,
    execution_store: Option<Arc<dyn ExecutionStore>>,
    selector: Option<Arc<dyn DistributionSelector>>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
}

impl BatchCoordinator {
    /// Coordinator with the default validator and resolver
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self {
            registry,
            validator: Arc::new(VariableValidator::new()),
            resolver: Arc::new(TemplateResolver::new()),
            template_store: None,
            execution_store: None,
            selector: None,
            retry_policy: None,
        }
    }

    /// Replace the default [`VariableValidator`]
    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = validator;
        self
    }

    /// Replace the default [`TemplateResolver`]
    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Source for [`execute_template`](Self::execute_template)
    pub fn with_template_store(mut self, store: Arc<dyn TemplateStore>) -> Self {
        self.template_store = Some(store);
        self
    }

    /// Sink for terminal attempts and batch records
    pub fn with_execution_store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.execution_store = Some(store);
        self
    }

    /// Use this selector instead of one built from the batch strategy
    ///
    /// A shared selector keeps its rotation state across batches.
    pub fn with_selector(mut self, selector: Arc<dyn DistributionSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Use this policy instead of one built from the batch retry options
    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Providers this coordinator dispatches to
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Execute one template against every value set
    pub async fn execute(
        &self,
        template: &TemplateDefinition,
        value_sets: Vec<VariableValueSet>,
        options: &BatchModelExecutionOptions,
        cancel: &CancellationSignal,
    ) -> Result<BatchExecutionResult> {
        self.run(template, value_sets, options, cancel, None).await
    }

    /// Like [`execute`](Self::execute), reporting progress to `observer`
    pub async fn execute_with_progress(
        &self,
        template: &TemplateDefinition,
        value_sets: Vec<VariableValueSet>,
        options: &BatchModelExecutionOptions,
        cancel: &CancellationSignal,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<BatchExecutionResult> {
        self.run(template, value_sets, options, cancel, Some(observer)).await
    }

    /// Load the template from the template store, then execute
    pub async fn execute_template(
        &self,
        template_id: &str,
        value_sets: Vec<VariableValueSet>,
        options: &BatchModelExecutionOptions,
        cancel: &CancellationSignal,
    ) -> Result<BatchExecutionResult> {
        let store = self
            .template_store
            .as_ref()
            .ok_or_else(|| PromptRunError::Configuration("no template store configured".into()))?;
        let template = store.get_template(template_id).await?;
        self.execute(&template, value_sets, options, cancel).await
    }

    /// Parse CSV rows for the template and execute the valid ones
    ///
    /// A malformed header fails before anything runs. Invalid rows are left
    /// out of the batch and reported in `parsed.diagnostics`.
    pub async fn execute_csv(
        &self,
        template: &TemplateDefinition,
        csv_text: &str,
        csv_options: &CsvParseOptions,
        options: &BatchModelExecutionOptions,
        cancel: &CancellationSignal,
    ) -> Result<CsvBatchExecution> {
        self.run_csv(template, csv_text, csv_options, options, cancel, None)
            .await
    }

    /// Like [`execute_csv`](Self::execute_csv), reporting progress to `observer`
    pub async fn execute_csv_with_progress(
        &self,
        template: &TemplateDefinition,
        csv_text: &str,
        csv_options: &CsvParseOptions,
        options: &BatchModelExecutionOptions,
        cancel: &CancellationSignal,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<CsvBatchExecution> {
        self.run_csv(template, csv_text, csv_options, options, cancel, Some(observer))
            .await
    }

    async fn run_csv(
        &self,
        template: &TemplateDefinition,
        csv_text: &str,
        csv_options: &CsvParseOptions,
        options: &BatchModelExecutionOptions,
        cancel: &CancellationSignal,
        observer: Option<Arc<dyn ProgressObserver>>,
    ) -> Result<CsvBatchExecution> {
        let parsed = parse_for_template(csv_text, template, csv_options)?;
        if !parsed.diagnostics.is_empty() {
            warn!(
                template_id = %template.id,
                invalid_rows = parsed.diagnostics.len(),
                valid_rows = parsed.value_sets.len(),
                "Skipping invalid CSV rows"
            );
        }
        let result = self
            .run(template, parsed.value_sets.clone(), options, cancel, observer)
            .await?;
        Ok(CsvBatchExecution { parsed, result })
    }

    #[instrument(
        skip(self, template, value_sets, options, external, observer),
        fields(template_id = %template.id, items = value_sets.len())
    )]
    async fn run(
        &self,
        template: &TemplateDefinition,
        value_sets: Vec<VariableValueSet>,
        options: &BatchModelExecutionOptions,
        external: &CancellationSignal,
        observer: Option<Arc<dyn ProgressObserver>>,
    ) -> Result<BatchExecutionResult> {
        options.validate()?;
        if self.registry.is_empty() {
            return Err(PromptRunError::Configuration("no providers registered".into()));
        }
        self.validator.check_definitions(&template.variables)?;

        let analysis = template.analyze()?;
        if !analysis.is_consistent() {
            return Err(TemplateError::UndefinedVariables {
                names: analysis.undefined,
            }
            .into());
        }
        if !analysis.unused.is_empty() {
            warn!(unused = ?analysis.unused, "Template defines variables it never references");
        }

        let batch_id = Uuid::new_v4();
        let started_at = Utc::now();
        let deadline = options.batch_timeout.map(|limit| tokio::time::Instant::now() + limit);
        let slots = self.prepare(batch_id, template, &value_sets)?;
        let rejected: Vec<ExecutionAttempt> = slots.iter().filter(|s| s.is_terminal()).cloned().collect();
        let pending = slots.len() - rejected.len();

        info!(
            %batch_id,
            total = slots.len(),
            rejected = rejected.len(),
            strategy = %options.distribution_strategy,
            max_concurrency = options.max_concurrency,
            "Starting batch"
        );

        let signal = CancellationSignal::new();
        let provider_ids = self.registry.ids().into_iter().map(String::from).collect();
        let context = Arc::new(WorkerContext {
            tracker: Arc::new(BatchTracker::new(batch_id, slots, provider_ids, observer)),
            registry: self.registry.clone(),
            selector: self.selector_for(options),
            retry_policy: self.retry_policy_for(options),
            execution: options.execution.clone(),
            continue_on_error: options.continue_on_error,
            signal: signal.clone(),
            persister: Persister::spawn(self.execution_store.clone()),
        });

        for attempt in &rejected {
            context.persister.attempt(attempt);
        }

        if external.is_cancelled() {
            signal.cancel_with(CancelReason::External);
        } else if !rejected.is_empty() && !options.continue_on_error {
            warn!(rejected = rejected.len(), "Invalid value sets, aborting before dispatch");
            signal.cancel_with(CancelReason::FailFast);
        }

        let worker_count = options.max_concurrency.min(pending);
        let handles: Vec<_> = (0..worker_count)
            .map(|worker_id| tokio::spawn(context.clone().run_worker(worker_id)))
            .collect();
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();

        let batch_timeout = options.batch_timeout;
        let workers = join_all(handles);
        tokio::pin!(workers);

        let joined = tokio::select! {
            biased;
            joined = &mut workers => Some(joined),
            _ = signal.cancelled() => None,
            _ = external.cancelled() => {
                if signal.cancel_with(CancelReason::External) {
                    info!(%batch_id, "Batch cancelled by caller");
                }
                None
            }
            _ = expired(deadline) => {
                if signal.cancel_with(CancelReason::Timeout) {
                    warn!(%batch_id, timeout = ?batch_timeout, "Batch deadline expired");
                }
                None
            }
        };
        let joined = match joined {
            Some(joined) => joined,
            None => tokio::select! {
                biased;
                joined = &mut workers => joined,
                _ = tokio::time::sleep(WORKER_STOP_GRACE) => {
                    warn!(%batch_id, "Workers did not stop after cancellation, aborting them");
                    for abort in &aborts {
                        abort.abort();
                    }
                    (&mut workers).await
                }
            },
        };
        for outcome in joined {
            match outcome {
                Err(e) if e.is_cancelled() => {}
                other => other?,
            }
        }

        let reason = signal.reason();
        let kind = match reason {
            Some(CancelReason::Timeout) => ItemErrorKind::Timeout,
            _ => ItemErrorKind::Cancelled,
        };
        let message = reason
            .map(|r| r.to_string())
            .unwrap_or_else(|| "batch stopped".to_string());
        let swept = context.tracker.cancel_remaining(kind, &message);
        if !swept.is_empty() {
            info!(%batch_id, cancelled = swept.len(), reason = %message, "Unfinished items cancelled");
        }
        for attempt in &swept {
            context.persister.attempt(attempt);
        }

        let final_state = context.tracker.final_state();
        let counters = final_state.counters;
        let elapsed = context.tracker.elapsed();
        let results: Vec<BatchItemResult> = final_state.attempts.iter().map(BatchItemResult::from).collect();
        let status = match reason {
            Some(CancelReason::Timeout) => BatchStatus::TimedOut,
            Some(CancelReason::External) => BatchStatus::Cancelled,
            Some(CancelReason::FailFast) => BatchStatus::Aborted,
            None if counters.failed == 0 => BatchStatus::Completed,
            None => BatchStatus::CompletedWithFailures,
        };

        let mut result = BatchExecutionResult {
            batch_id,
            template_id: template.id.clone(),
            status,
            strategy: options.distribution_strategy,
            statistics: summarize(&results, &counters, elapsed, context.persister.failures()),
            results,
            counters,
            provider_usage: final_state.usage,
            started_at,
            finished_at: Utc::now(),
        };

        context.persister.batch(BatchJobRecord::from(&result));
        let flush_by = deadline.map(|at| at.max(tokio::time::Instant::now() + STORE_FLUSH_GRACE));
        if !context.persister.flush(flush_by).await {
            warn!(%batch_id, "Returning before every execution record was written");
        }
        result.statistics.store_failures = context.persister.failures();

        info!(
            %batch_id,
            status = ?result.status,
            succeeded = counters.succeeded,
            failed = counters.failed,
            skipped = counters.skipped,
            elapsed_ms = elapsed.as_millis() as u64,
            "Batch finished"
        );
        Ok(result)
    }

    /// Validate and resolve every value set
    fn prepare(
        &self,
        batch_id: Uuid,
        template: &TemplateDefinition,
        value_sets: &[VariableValueSet],
    ) -> Result<Vec<ExecutionAttempt>> {
        value_sets
            .iter()
            .enumerate()
            .map(|(index, values)| {
                let outcome = self.validator.validate(&template.variables, values)?;
                if let ValidationOutcome::Invalid { errors } = &outcome {
                    debug!(request_index = index, errors = %outcome.summary(), "Value set rejected");
                    let code = errors.first().map(|e| e.kind.code()).unwrap_or("invalid");
                    return Ok(ExecutionAttempt::rejected(
                        batch_id,
                        index,
                        ItemError {
                            kind: ItemErrorKind::Validation,
                            code: code.to_string(),
                            message: outcome.summary(),
                        },
                    ));
                }

                Ok(match self.resolver.resolve(template, values) {
                    Ok(resolved) => ExecutionAttempt::pending(batch_id, index, resolved),
                    Err(e) => ExecutionAttempt::rejected(
                        batch_id,
                        index,
                        ItemError {
                            kind: ItemErrorKind::Validation,
                            code: "unresolved".to_string(),
                            message: e.to_string(),
                        },
                    ),
                })
            })
            .collect()
    }

    fn selector_for(&self, options: &BatchModelExecutionOptions) -> Arc<dyn DistributionSelector> {
        if let Some(selector) = &self.selector {
            return selector.clone();
        }
        let strategy = options.distribution_strategy;
        Arc::new(match options.random_seed {
            Some(seed) => StrategySelector::with_seed(strategy, seed),
            None => StrategySelector::new(strategy),
        })
    }

    fn retry_policy_for(&self, options: &BatchModelExecutionOptions) -> Arc<dyn RetryPolicy> {
        if let Some(policy) = &self.retry_policy {
            return policy.clone();
        }
        let retry = options.execution.retry.clone();
        Arc::new(match options.random_seed {
            Some(seed) => BackoffRetryPolicy::with_seed(retry, seed),
            None => BackoffRetryPolicy::new(retry),
        })
    }
}

/// Everything a worker shares with the coordinator for one batch
struct WorkerContext {
    tracker: Arc<BatchTracker>,
    registry: Arc<ProviderRegistry>,
    selector: Arc<dyn DistributionSelector>,
    retry_policy: Arc<dyn RetryPolicy>,
    execution: ModelExecutionOptions,
    continue_on_error: bool,
    signal: CancellationSignal,
    persister: Persister,
}

impl WorkerContext {
    async fn run_worker(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "Worker started");
        while let Some(index) = self.tracker.next(&self.signal).await {
            // Provider panics are caught in `call_provider`; anything reaching
            // here is an engine fault, so stop the batch before unwinding.
            if let Err(panic) = AssertUnwindSafe(self.process(index)).catch_unwind().await {
                error!(
                    worker_id,
                    request_index = index,
                    panic = %panic_message(panic.as_ref()),
                    "Worker panicked, stopping batch"
                );
                self.signal.cancel_with(CancelReason::FailFast);
                std::panic::resume_unwind(panic);
            }
        }
        debug!(worker_id, "Worker stopped");
    }

    async fn process(&self, index: usize) {
        let Some(dispatch) = self.tracker.begin(index) else {
            return;
        };

        let snapshot = self.registry.snapshot();
        let selected = self
            .selector
            .select(&snapshot)
            .ok()
            .and_then(|id| self.registry.client(&id).map(|client| (id, client)));
        let Some((provider_id, client)) = selected else {
            warn!(request_index = index, attempt = dispatch.attempt, "No provider available");
            self.handle_failure(index, dispatch.attempt, FailureInfo::no_provider_available(), None);
            return;
        };

        // A cancellation that raced with dequeueing must not lead to a call.
        if self.signal.is_cancelled() || !self.tracker.mark_running(index, &provider_id) {
            return;
        }
        self.registry.health().record_dispatch(&provider_id);
        metrics::record_call_started();
        debug!(
            request_index = index,
            provider_id = %provider_id,
            attempt = dispatch.attempt,
            "Dispatching"
        );

        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = self.signal.cancelled() => None,
            outcome = self.call_provider(client.as_ref(), &dispatch.prompt) => Some(outcome),
        };
        let latency = started.elapsed();

        match outcome {
            None => {
                self.observe(&provider_id, ObservedOutcome::Cancelled, latency, None);
                metrics::record_call_finished(&provider_id, CallOutcome::Cancelled, latency);
                debug!(request_index = index, provider_id = %provider_id, "Call abandoned");
            }
            Some(Ok(response)) if response.success => {
                self.observe(&provider_id, ObservedOutcome::Success, latency, response.cost_estimate);
                metrics::record_call_finished(&provider_id, CallOutcome::Success, latency);
                self.tracker.record_call(&provider_id, true, latency);
                if let Some(attempt) =
                    self.tracker
                        .finish(index, AttemptStatus::Succeeded, Some(response), None)
                {
                    self.persister.attempt(&attempt);
                }
            }
            Some(Ok(response)) => {
                let failure = FailureInfo::from_response(&response);
                self.observe(&provider_id, ObservedOutcome::Failure, latency, response.cost_estimate);
                metrics::record_call_finished(&provider_id, CallOutcome::Failure, latency);
                self.tracker.record_call(&provider_id, false, latency);
                self.handle_failure(index, dispatch.attempt, failure, Some(response));
            }
            Some(Err(failure)) => {
                let label = if failure.code == "timeout" {
                    CallOutcome::Timeout
                } else {
                    CallOutcome::Failure
                };
                self.observe(&provider_id, ObservedOutcome::Failure, latency, None);
                metrics::record_call_finished(&provider_id, label, latency);
                self.tracker.record_call(&provider_id, false, latency);
                self.handle_failure(index, dispatch.attempt, failure, None);
            }
        }
    }

    async fn call_provider(
        &self,
        client: &dyn ProviderClient,
        prompt: &str,
    ) -> std::result::Result<ProviderResponse, FailureInfo> {
        let call = AssertUnwindSafe(client.execute(prompt, &self.execution, &self.signal)).catch_unwind();
        let result = match self.execution.timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => return Err(FailureInfo::call_timeout(limit)),
            },
            None => call.await,
        };
        match result {
            Ok(result) => result.map_err(|e| FailureInfo::from_error(&e)),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "Provider client panicked");
                Err(FailureInfo::transient(
                    "panic",
                    format!("provider client panicked: {}", message),
                ))
            }
        }
    }

    fn handle_failure(
        &self,
        index: usize,
        attempt: u32,
        failure: FailureInfo,
        response: Option<ProviderResponse>,
    ) {
        match self.retry_policy.decide(attempt, &failure) {
            RetryDecision::Retry { delay } => {
                if !self
                    .tracker
                    .mark_retrying(index, failure.clone().into_item_error(), response)
                {
                    return;
                }
                metrics::record_retry();
                info!(
                    request_index = index,
                    attempt,
                    code = %failure.code,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after transient failure"
                );
                self.schedule_retry(index, delay);
            }
            RetryDecision::GiveUp => {
                warn!(
                    request_index = index,
                    attempt,
                    code = %failure.code,
                    error = %failure.message,
                    "Item failed"
                );
                if !self.continue_on_error && self.signal.cancel_with(CancelReason::FailFast) {
                    warn!(request_index = index, "Cancelling remaining items after failure");
                }
                if let Some(terminal) = self.tracker.finish(
                    index,
                    AttemptStatus::Failed,
                    response,
                    Some(failure.into_item_error()),
                ) {
                    self.persister.attempt(&terminal);
                }
            }
        }
    }

    /// Re-queue after `delay` without holding a worker
    fn schedule_retry(&self, index: usize, delay: Duration) {
        let tracker = Arc::clone(&self.tracker);
        let signal = self.signal.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = signal.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    tracker.requeue(index);
                }
            }
        });
    }

    fn observe(&self, provider_id: &str, outcome: ObservedOutcome, latency: Duration, cost: Option<f64>) {
        self.registry.health().record_outcome(&ProviderObservation {
            provider_id: provider_id.to_string(),
            outcome,
            latency,
            cost,
        });
    }

}

async fn expired(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn summarize(
    results: &[BatchItemResult],
    counters: &BatchCounters,
    elapsed: Duration,
    store_failures: usize,
) -> BatchStatistics {
    let dispatched: Vec<Duration> = results
        .iter()
        .filter(|r| r.attempts > 0)
        .map(|r| r.duration)
        .collect();
    let average_duration = if dispatched.is_empty() {
        Duration::ZERO
    } else {
        dispatched.iter().sum::<Duration>() / dispatched.len() as u32
    };

    let costs: Vec<f64> = results.iter().filter_map(|r| r.cost).collect();
    let total_cost = if costs.is_empty() {
        None
    } else {
        Some(costs.iter().sum())
    };

    let secs = elapsed.as_secs_f64();
    BatchStatistics {
        average_duration,
        total_tokens: results.iter().map(|r| r.tokens_used).sum(),
        total_cost,
        throughput: if secs > 0.0 { counters.completed as f64 / secs } else { 0.0 },
        elapsed,
        store_failures,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::RetryOptions;
    use crate::provider::ProviderError;
    use crate::template::VariableDefinition;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct Upper;

    #[async_trait]
    impl ProviderClient for Upper {
        async fn execute(
            &self,
            prompt: &str,
            _options: &ModelExecutionOptions,
            _cancel: &CancellationSignal,
        ) -> std::result::Result<ProviderResponse, ProviderError> {
            Ok(ProviderResponse::success(prompt.to_uppercase()).with_tokens(3).with_cost(0.5))
        }
    }

    fn coordinator() -> BatchCoordinator {
        let registry = ProviderRegistry::new().with_provider("upper", Arc::new(Upper)).unwrap();
        BatchCoordinator::new(Arc::new(registry))
    }

    fn template() -> TemplateDefinition {
        TemplateDefinition::new("greet", "hi {{name}}").with_variable(VariableDefinition::required("name"))
    }

    fn options() -> BatchModelExecutionOptions {
        BatchModelExecutionOptions::default()
            .with_max_concurrency(2)
            .with_retry(RetryOptions::none())
    }

    #[tokio::test]
    async fn test_happy_path_aggregates() {
        let sets = vec![
            VariableValueSet::new().with("name", "sam"),
            VariableValueSet::new().with("name", "ada"),
        ];
        let result = coordinator()
            .execute(&template(), sets, &options(), &CancellationSignal::new())
            .await
            .unwrap();

        assert_eq!(result.status, BatchStatus::Completed);
        assert_eq!(result.results[1].content.as_deref(), Some("HI ADA"));
        assert_eq!(result.statistics.total_tokens, 6);
        assert_eq!(result.statistics.total_cost, Some(1.0));
        assert_eq!(result.usage_for("upper").unwrap().requests, 2);
    }

    #[tokio::test]
    async fn test_undefined_placeholder_is_a_hard_error() {
        let template = TemplateDefinition::new("t", "hi {{name}} {{ghost}}")
            .with_variable(VariableDefinition::required("name"));
        let err = coordinator()
            .execute(&template, vec![], &options(), &CancellationSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PromptRunError::Template(TemplateError::UndefinedVariables { .. })
        ));
    }

    #[tokio::test]
    async fn test_no_providers_is_a_configuration_error() {
        let coordinator = BatchCoordinator::new(Arc::new(ProviderRegistry::new()));
        let err = coordinator
            .execute(&template(), vec![], &options(), &CancellationSignal::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PromptRunError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_empty_batch_completes() {
        let result = coordinator()
            .execute(&template(), vec![], &options(), &CancellationSignal::new())
            .await
            .unwrap();
        assert_eq!(result.status, BatchStatus::Completed);
        assert!(result.results.is_empty());
        assert_eq!(result.counters, BatchCounters::new(0));
    }

    #[tokio::test]
    async fn test_validation_failure_never_reaches_provider() {
        let sets = vec![VariableValueSet::new(), VariableValueSet::new().with("name", "bo")];
        let result = coordinator()
            .execute(&template(), sets, &options(), &CancellationSignal::new())
            .await
            .unwrap();

        assert_eq!(result.status, BatchStatus::CompletedWithFailures);
        let rejected = &result.results[0];
        assert_eq!(rejected.attempts, 0);
        assert_eq!(rejected.provider_id, None);
        assert_eq!(rejected.error.as_ref().unwrap().kind, ItemErrorKind::Validation);
        assert_eq!(rejected.error.as_ref().unwrap().code, "missing");
        assert!(result.results[1].success);
    }

    #[tokio::test]
    async fn test_fail_fast_on_validation_dispatches_nothing() {
        let sets = vec![VariableValueSet::new(), VariableValueSet::new().with("name", "bo")];
        let options = options().with_continue_on_error(false);
        let result = coordinator()
            .execute(&template(), sets, &options, &CancellationSignal::new())
            .await
            .unwrap();

        assert_eq!(result.status, BatchStatus::Aborted);
        assert_eq!(result.results[1].status, AttemptStatus::Cancelled);
        assert_eq!(result.results[1].attempts, 0);
        assert_eq!(result.counters.skipped, 1);
    }
}
