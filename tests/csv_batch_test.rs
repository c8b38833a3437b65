//! CSV-driven batches

mod common;

use std::sync::Arc;

use common::{invoice_template, MockProvider};
use pretty_assertions::assert_eq;
use promptrun::batch::{BatchCoordinator, BatchModelExecutionOptions, BatchStatus, CancellationSignal, RetryOptions};
use promptrun::provider::ProviderRegistry;
use promptrun::tabular::{CsvParseOptions, ParseError};
use promptrun::PromptRunError;

fn coordinator(provider: Arc<MockProvider>) -> BatchCoordinator {
    let registry = ProviderRegistry::new().with_provider("mock", provider).unwrap();
    BatchCoordinator::new(Arc::new(registry))
}

fn options() -> BatchModelExecutionOptions {
    BatchModelExecutionOptions::default()
        .with_max_concurrency(2)
        .with_retry(RetryOptions::none())
}

#[tokio::test]
async fn test_invalid_rows_are_reported_and_skipped() {
    let provider = Arc::new(MockProvider::echo());
    let csv = "name,amount\nSam,42\nAda,\nLin,7\nBo,3\n";

    let run = coordinator(provider.clone())
        .execute_csv(&invoice_template(), csv, &CsvParseOptions::default(), &options(), &CancellationSignal::new())
        .await
        .unwrap();

    assert_eq!(provider.calls(), 3);
    assert_eq!(run.result.status, BatchStatus::Completed);
    assert_eq!(run.result.results.len(), 3);
    assert_eq!(run.parsed.diagnostics.len(), 1);
    assert_eq!(run.parsed.diagnostics[0].row_index, 1);
    assert_eq!(run.parsed.diagnostics[0].missing_columns, vec!["amount".to_string()]);

    let contents: Vec<_> = run.result.results.iter().map(|r| r.content.clone().unwrap()).collect();
    assert_eq!(
        contents,
        vec!["Hi Sam, you owe 42", "Hi Lin, you owe 7", "Hi Bo, you owe 3"]
    );
    assert_eq!(run.source_row(0), Some(0));
    assert_eq!(run.source_row(1), Some(2));
    assert_eq!(run.source_row(2), Some(3));
    assert_eq!(run.source_row(3), None);
}

#[tokio::test]
async fn test_bad_header_fails_before_dispatch() {
    let provider = Arc::new(MockProvider::echo());
    let err = coordinator(provider.clone())
        .execute_csv(
            &invoice_template(),
            "name,note\nSam,hello\n",
            &CsvParseOptions::default(),
            &options(),
            &CancellationSignal::new(),
        )
        .await
        .unwrap_err();

    match err {
        PromptRunError::Parse(ParseError::MissingHeaderColumns { missing }) => {
            assert_eq!(missing, vec!["amount".to_string()])
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn test_semicolon_delimited_input() {
    let provider = Arc::new(MockProvider::echo());
    let csv = "name;amount\n\"Smith; John\";5\n";
    let run = coordinator(provider)
        .execute_csv(
            &invoice_template(),
            csv,
            &CsvParseOptions::default().with_delimiter(';'),
            &options(),
            &CancellationSignal::new(),
        )
        .await
        .unwrap();

    assert_eq!(run.result.results[0].content.as_deref(), Some("Hi Smith; John, you owe 5"));
}
