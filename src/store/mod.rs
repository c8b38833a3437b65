//! Storage collaborators
//!
//! The engine reads templates from a [`TemplateStore`] and writes terminal
//! attempts and batch summaries to an [`ExecutionStore`]. Execution store
//! failures are logged and counted by the coordinator but never fail a batch.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::batch::{BatchJobRecord, ExecutionAttempt};
use crate::template::TemplateDefinition;

mod memory;

pub use memory::{InMemoryExecutionStore, InMemoryTemplateStore};

/// Errors related to storage
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// No template with this id
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    /// The write was refused
    #[error("Failed to write record: {0}")]
    WriteFailed(String),

    /// The backing store cannot be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Read-only template source
#[async_trait]
pub trait TemplateStore: Send + Sync {
    /// Load a template by id
    async fn get_template(&self, id: &str) -> Result<TemplateDefinition, StoreError>;
}

/// Sink for execution records
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Persist one terminal attempt
    async fn record_attempt(&self, attempt: &ExecutionAttempt) -> Result<(), StoreError>;

    /// Persist the summary of a finished batch
    async fn record_batch(&self, record: &BatchJobRecord) -> Result<(), StoreError>;
}

/// Convenience lookups for stores that can list what they hold
#[async_trait]
pub trait ExecutionHistory: Send + Sync {
    /// Terminal attempts of one batch, ordered by `request_index`
    async fn attempts_for(&self, batch_id: Uuid) -> Vec<ExecutionAttempt>;

    /// Summary record of one batch
    async fn batch(&self, batch_id: Uuid) -> Option<BatchJobRecord>;
}
