//! Run a CSV file through a template against two simulated providers
//!
//! ```text
//! RUST_LOG=promptrun=debug cargo run --example csv_batch
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use promptrun::batch::{
    BatchCoordinator, BatchModelExecutionOptions, CancellationSignal, ModelExecutionOptions,
    RetryOptions,
};
use promptrun::provider::{
    DistributionStrategy, ProviderClient, ProviderError, ProviderRegistry, ProviderResponse,
};
use promptrun::tabular::CsvParseOptions;
use promptrun::template::{TemplateDefinition, VariableDefinition, VariableType};
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

const INVOICES: &str = "\
name,amount,due
Sam Carter,42.50,2026-11-01
Ada Byron,,2026-11-03
Lin Zhou,7,2026-11-04
Bo Ortiz,1200,2026-11-05
Kai Moana,18,2026-11-09
";

/// Simulated provider with a fixed latency and an occasional rate limit
struct SimulatedProvider {
    latency: Duration,
    flaky: bool,
}

#[async_trait]
impl ProviderClient for SimulatedProvider {
    async fn execute(
        &self,
        prompt: &str,
        _options: &ModelExecutionOptions,
        cancel: &CancellationSignal,
    ) -> Result<ProviderResponse, ProviderError> {
        tokio::select! {
            _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
            _ = tokio::time::sleep(self.latency) => {}
        }
        if self.flaky && prompt.contains("Bo Ortiz") && rand::random::<bool>() {
            return Err(ProviderError::RateLimited {
                retry_after: Some(Duration::from_millis(50)),
            });
        }
        Ok(ProviderResponse::success(format!("Drafted: {}", prompt))
            .with_tokens(prompt.split_whitespace().count() as u64)
            .with_latency(self.latency))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("promptrun=info")))
        .init();

    let mut registry = ProviderRegistry::new();
    registry.register(
        "fast",
        Arc::new(SimulatedProvider {
            latency: Duration::from_millis(30),
            flaky: true,
        }),
    )?;
    registry.register(
        "steady",
        Arc::new(SimulatedProvider {
            latency: Duration::from_millis(80),
            flaky: false,
        }),
    )?;

    let template = TemplateDefinition::new(
        "payment-reminder",
        "Write a polite reminder to {{name}} that {{amount}} EUR is due on {{due}}.",
    )
    .with_variable(VariableDefinition::required("name"))
    .with_variable(VariableDefinition::required("amount").with_type(VariableType::Number))
    .with_variable(VariableDefinition::required("due"));

    let options = BatchModelExecutionOptions::default()
        .with_max_concurrency(2)
        .with_strategy(DistributionStrategy::LeastLoaded)
        .with_batch_timeout(Duration::from_secs(10))
        .with_retry(
            RetryOptions::default()
                .with_max_retries(2)
                .with_base_delay(Duration::from_millis(100)),
        );

    let (observer, mut progress) = options.progress_channel();
    let printer = tokio::spawn(async move {
        while let Some(p) = progress.next().await {
            println!(
                "progress #{:<2} {:>5.1}% ({} ok, {} failed, {} skipped)",
                p.sequence,
                p.percent_complete(),
                p.successful_requests,
                p.failed_requests,
                p.skipped_requests
            );
        }
    });

    let coordinator = BatchCoordinator::new(Arc::new(registry));
    let run = coordinator
        .execute_csv_with_progress(
            &template,
            INVOICES,
            &CsvParseOptions::default().with_column_type("amount", VariableType::Number),
            &options,
            &CancellationSignal::new(),
            Arc::new(observer),
        )
        .await?;
    // The stream ends once the coordinator has dropped the observer.
    printer.await?;

    for diagnostic in &run.parsed.diagnostics {
        println!(
            "row {} skipped: missing {:?}",
            diagnostic.row_index, diagnostic.missing_columns
        );
    }
    for item in &run.result.results {
        let row = run.source_row(item.request_index).unwrap_or_default();
        match (&item.content, &item.error) {
            (Some(content), _) => println!(
                "row {} via {}: {}",
                row,
                item.provider_id.as_deref().unwrap_or("-"),
                content
            ),
            (None, Some(error)) => println!("row {} failed: {}", row, error),
            (None, None) => println!("row {} produced no content", row),
        }
    }
    for usage in &run.result.provider_usage {
        println!(
            "{}: {} requests, {} ok, avg {:?}",
            usage.provider_id, usage.requests, usage.successes, usage.average_duration
        );
    }
    println!("status: {:?}", run.result.status);

    Ok(())
}
