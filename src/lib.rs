//! # promptrun
//!
//! Variable resolution and batch execution for prompt templates.
//!
//! ## Overview
//!
//! A prompt template carries `{{name}}` placeholders. promptrun extracts and
//! validates them, resolves a template against concrete value sets, and runs
//! many resolutions concurrently against one or more model providers with
//! bounded concurrency, retry with backoff, provider distribution strategies,
//! partial-failure tolerance and progress reporting.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use promptrun::batch::{BatchCoordinator, BatchModelExecutionOptions, CancellationSignal};
//! use promptrun::provider::ProviderRegistry;
//! use promptrun::template::{TemplateDefinition, VariableDefinition, VariableValueSet};
//!
//! # async fn example(client: Arc<dyn promptrun::provider::ProviderClient>) -> promptrun::Result<()> {
//! let mut registry = ProviderRegistry::new();
//! registry.register("primary", client)?;
//!
//! let template = TemplateDefinition::new("greeting", "Hi {{name}}, you owe {{amount}}")
//!     .with_variable(VariableDefinition::required("name"))
//!     .with_variable(VariableDefinition::required("amount"));
//!
//! let values = vec![VariableValueSet::new().with("name", "Sam").with("amount", "42")];
//!
//! let coordinator = BatchCoordinator::new(Arc::new(registry));
//! let result = coordinator
//!     .execute(&template, values, &BatchModelExecutionOptions::default(), &CancellationSignal::new())
//!     .await?;
//! println!("{} succeeded", result.counters.succeeded);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`template`]: placeholder extraction, validation and resolution
//! - [`tabular`]: CSV input with row-level diagnostics
//! - [`provider`]: provider clients, health tracking and distribution
//! - [`batch`]: the batch coordinator, retry policy and progress reporting
//! - [`store`]: template and execution store collaborators
//! - [`config`]: JSON engine configuration

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

pub mod batch;
pub mod config;
pub mod provider;
pub mod store;
pub mod tabular;
pub mod template;
pub mod value;

/// Result type for promptrun operations
pub type Result<T> = std::result::Result<T, PromptRunError>;

/// Hard failures that stop a batch before dispatch
///
/// Failures of individual items are never reported through this type; they
/// are captured in [`batch::BatchItemResult::error`].
#[derive(Error, Debug)]
pub enum PromptRunError {
    /// Template syntax or definition error
    #[error("Template error: {0}")]
    Template(#[from] template::TemplateError),

    /// Tabular input that cannot be used at all
    #[error("Parse error: {0}")]
    Parse(#[from] tabular::ParseError),

    /// Template or execution store error
    #[error("Store error: {0}")]
    Store(#[from] store::StoreError),

    /// Invalid options or missing collaborators
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Join error from worker tasks
    #[error("Async join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub use batch::{
    BatchCoordinator, BatchExecutionProgress, BatchExecutionResult, BatchModelExecutionOptions,
    CancellationSignal,
};
pub use provider::{DistributionStrategy, ProviderClient, ProviderRegistry, ProviderResponse};
pub use template::{TemplateDefinition, VariableDefinition, VariableValueSet};
pub use value::VariableValue;
