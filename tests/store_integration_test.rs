//! Template and execution store integration

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::{invoice_template, invoice_values, MockProvider};
use pretty_assertions::assert_eq;
use promptrun::batch::{
    BatchCoordinator, BatchJobRecord, BatchModelExecutionOptions, BatchStatus, CancellationSignal,
    ExecutionAttempt, RetryOptions,
};
use promptrun::provider::ProviderRegistry;
use promptrun::store::{
    ExecutionHistory, ExecutionStore, InMemoryExecutionStore, InMemoryTemplateStore, StoreError,
};
use promptrun::PromptRunError;

fn registry() -> Arc<ProviderRegistry> {
    Arc::new(
        ProviderRegistry::new()
            .with_provider("mock", Arc::new(MockProvider::echo()))
            .unwrap(),
    )
}

fn options() -> BatchModelExecutionOptions {
    BatchModelExecutionOptions::default()
        .with_max_concurrency(2)
        .with_retry(RetryOptions::none())
}

/// Store that refuses every write
struct BrokenStore;

#[async_trait]
impl ExecutionStore for BrokenStore {
    async fn record_attempt(&self, _attempt: &ExecutionAttempt) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk full".into()))
    }

    async fn record_batch(&self, _record: &BatchJobRecord) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk full".into()))
    }
}

/// Store whose writes never complete
struct StuckStore;

#[async_trait]
impl ExecutionStore for StuckStore {
    async fn record_attempt(&self, _attempt: &ExecutionAttempt) -> Result<(), StoreError> {
        std::future::pending().await
    }

    async fn record_batch(&self, _record: &BatchJobRecord) -> Result<(), StoreError> {
        std::future::pending().await
    }
}

#[tokio::test]
async fn test_terminal_attempts_are_persisted() {
    let store = InMemoryExecutionStore::new();
    let coordinator = BatchCoordinator::new(registry()).with_execution_store(Arc::new(store.clone()));

    let mut values = invoice_values(3);
    values.push(promptrun::VariableValueSet::new().with("name", "nobody"));

    let result = coordinator
        .execute(&invoice_template(), values, &options(), &CancellationSignal::new())
        .await
        .unwrap();

    let attempts = store.attempts_for(result.batch_id).await;
    assert_eq!(attempts.len(), 4);
    assert!(attempts.iter().all(|a| a.is_terminal()));
    let indices: Vec<usize> = attempts.iter().map(|a| a.request_index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);

    let record = store.batch(result.batch_id).await.expect("batch record");
    assert_eq!(record.status, BatchStatus::CompletedWithFailures);
    assert_eq!(record.counters, result.counters);
    assert_eq!(result.statistics.store_failures, 0);
}

#[tokio::test]
async fn test_store_failures_do_not_fail_the_batch() {
    let coordinator = BatchCoordinator::new(registry()).with_execution_store(Arc::new(BrokenStore));

    let result = coordinator
        .execute(&invoice_template(), invoice_values(3), &options(), &CancellationSignal::new())
        .await
        .unwrap();

    assert_eq!(result.status, BatchStatus::Completed);
    assert_eq!(result.counters.succeeded, 3);
    // three attempts plus the batch record
    assert_eq!(result.statistics.store_failures, 4);
}

#[tokio::test]
async fn test_stuck_store_neither_holds_workers_nor_outlives_the_deadline() {
    let coordinator = BatchCoordinator::new(registry()).with_execution_store(Arc::new(StuckStore));
    let options = options()
        .with_max_concurrency(1)
        .with_batch_timeout(Duration::from_millis(200));

    let started = Instant::now();
    let result = tokio::time::timeout(
        Duration::from_secs(2),
        coordinator.execute(&invoice_template(), invoice_values(4), &options, &CancellationSignal::new()),
    )
    .await
    .expect("batch must return despite a stuck store")
    .unwrap();

    // A single worker still gets through every item while writes hang.
    assert_eq!(result.status, BatchStatus::Completed);
    assert_eq!(result.counters.succeeded, 4);
    assert_eq!(result.statistics.store_failures, 0);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_execute_template_loads_from_store() {
    let templates = InMemoryTemplateStore::new();
    templates.insert(invoice_template());
    let coordinator = BatchCoordinator::new(registry()).with_template_store(Arc::new(templates));

    let result = coordinator
        .execute_template("invoice", invoice_values(2), &options(), &CancellationSignal::new())
        .await
        .unwrap();
    assert_eq!(result.template_id, "invoice");
    assert_eq!(result.counters.succeeded, 2);

    let err = coordinator
        .execute_template("missing", invoice_values(1), &options(), &CancellationSignal::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PromptRunError::Store(StoreError::TemplateNotFound(ref id)) if id == "missing"
    ));
}

#[tokio::test]
async fn test_execute_template_without_store_is_configuration_error() {
    let coordinator = BatchCoordinator::new(registry());
    let err = coordinator
        .execute_template("invoice", invoice_values(1), &options(), &CancellationSignal::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PromptRunError::Configuration(_)));
}
