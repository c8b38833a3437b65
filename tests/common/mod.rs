//! Instrumented provider clients shared by the integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use promptrun::batch::{CancellationSignal, ModelExecutionOptions};
use promptrun::provider::{ProviderClient, ProviderError, ProviderResponse};
use promptrun::template::{TemplateDefinition, VariableDefinition, VariableValueSet};

type Behavior = dyn Fn(&str, usize) -> Result<ProviderResponse, ProviderError> + Send + Sync;

/// Mock client that counts calls and concurrent calls
///
/// The behavior receives the prompt and how many times that prompt has been
/// seen, starting at 1.
pub struct MockProvider {
    delay: Box<dyn Fn(&str) -> Duration + Send + Sync>,
    behavior: Box<Behavior>,
    calls: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    prompts: Mutex<Vec<String>>,
    seen: Mutex<HashMap<String, usize>>,
}

struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockProvider {
    pub fn new<F>(behavior: F) -> Self
    where
        F: Fn(&str, usize) -> Result<ProviderResponse, ProviderError> + Send + Sync + 'static,
    {
        Self {
            delay: Box::new(|_| Duration::ZERO),
            behavior: Box::new(behavior),
            calls: AtomicUsize::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
            prompts: Mutex::new(Vec::new()),
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Echoes the prompt back
    pub fn echo() -> Self {
        Self::new(|prompt, _| Ok(ProviderResponse::success(prompt).with_tokens(10)))
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.with_delay_fn(move |_| delay)
    }

    pub fn with_delay_fn<F>(mut self, delay: F) -> Self
    where
        F: Fn(&str) -> Duration + Send + Sync + 'static,
    {
        self.delay = Box::new(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    async fn execute(
        &self,
        prompt: &str,
        _options: &ModelExecutionOptions,
        cancel: &CancellationSignal,
    ) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(prompt.to_string());
        let nth = {
            let mut seen = self.seen.lock();
            let count = seen.entry(prompt.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlightGuard(self.in_flight.clone());

        let delay = (self.delay)(prompt);
        if !delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ProviderError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        (self.behavior)(prompt, nth)
    }
}

/// `"Hi {{name}}, you owe {{amount}}"` with both variables required
pub fn invoice_template() -> TemplateDefinition {
    TemplateDefinition::new("invoice", "Hi {{name}}, you owe {{amount}}")
        .with_variable(VariableDefinition::required("name"))
        .with_variable(VariableDefinition::required("amount"))
}

pub fn invoice_values(count: usize) -> Vec<VariableValueSet> {
    (0..count)
        .map(|i| {
            VariableValueSet::new()
                .with("name", format!("user{}", i))
                .with("amount", i as i64)
        })
        .collect()
}

pub fn invoice_prompt(i: usize) -> String {
    format!("Hi user{}, you owe {}", i, i)
}
