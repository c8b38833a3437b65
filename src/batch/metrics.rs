//! Prometheus metrics for batch execution
//!
//! Metrics are registered once in the default registry and shared by every
//! coordinator in the process.

use std::time::Duration;

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

use super::types::AttemptStatus;

lazy_static! {
    /// Items reaching a terminal state
    static ref BATCH_ITEMS: IntCounterVec = register_int_counter_vec!(
        "promptrun_batch_items_total",
        "Batch items by terminal status",
        &["status"]
    ).unwrap();

    /// Provider calls by outcome
    static ref PROVIDER_CALLS: IntCounterVec = register_int_counter_vec!(
        "promptrun_provider_calls_total",
        "Provider calls by provider and outcome",
        &["provider", "outcome"]
    ).unwrap();

    static ref PROVIDER_CALL_DURATION: HistogramVec = register_histogram_vec!(
        "promptrun_provider_call_duration_seconds",
        "Provider call latency in seconds",
        &["provider"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    ).unwrap();

    static ref RETRIES: IntCounter = register_int_counter!(
        "promptrun_retries_total",
        "Retries scheduled after transient failures"
    ).unwrap();

    static ref ACTIVE_PROVIDER_CALLS: IntGauge = register_int_gauge!(
        "promptrun_active_provider_calls",
        "Provider calls currently in flight"
    ).unwrap();
}

/// Outcome label for provider call metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// Provider returned a successful response
    Success,
    /// Provider failed or returned a failure response
    Failure,
    /// Per-call timeout expired
    Timeout,
    /// Abandoned because the batch was cancelled
    Cancelled,
}

impl CallOutcome {
    fn label(self) -> &'static str {
        match self {
            CallOutcome::Success => "success",
            CallOutcome::Failure => "failure",
            CallOutcome::Timeout => "timeout",
            CallOutcome::Cancelled => "cancelled",
        }
    }
}

pub(crate) fn record_item(status: AttemptStatus) {
    BATCH_ITEMS.with_label_values(&[status.as_str()]).inc();
}

pub(crate) fn record_call_started() {
    ACTIVE_PROVIDER_CALLS.inc();
}

pub(crate) fn record_call_finished(provider: &str, outcome: CallOutcome, duration: Duration) {
    ACTIVE_PROVIDER_CALLS.dec();
    PROVIDER_CALLS
        .with_label_values(&[provider, outcome.label()])
        .inc();
    PROVIDER_CALL_DURATION
        .with_label_values(&[provider])
        .observe(duration.as_secs_f64());
}

pub(crate) fn record_retry() {
    RETRIES.inc();
}

/// Render all registered metrics in the Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
