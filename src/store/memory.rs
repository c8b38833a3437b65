use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use uuid::Uuid;

use super::{ExecutionHistory, ExecutionStore, StoreError, TemplateStore};
use crate::batch::{BatchJobRecord, ExecutionAttempt};
use crate::template::TemplateDefinition;

/// In-memory template storage
#[derive(Debug, Clone, Default)]
pub struct InMemoryTemplateStore {
    templates: Arc<DashMap<String, TemplateDefinition>>,
}

impl InMemoryTemplateStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a template
    pub fn insert(&self, template: TemplateDefinition) {
        self.templates.insert(template.id.clone(), template);
    }

    /// Number of stored templates
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Whether the store holds no templates
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

#[async_trait]
impl TemplateStore for InMemoryTemplateStore {
    async fn get_template(&self, id: &str) -> Result<TemplateDefinition, StoreError> {
        self.templates
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::TemplateNotFound(id.to_string()))
    }
}

/// In-memory execution log, mostly for tests and demos
#[derive(Debug, Clone, Default)]
pub struct InMemoryExecutionStore {
    attempts: Arc<RwLock<Vec<ExecutionAttempt>>>,
    batches: Arc<RwLock<Vec<BatchJobRecord>>>,
}

impl InMemoryExecutionStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded attempt, in write order
    pub fn attempts(&self) -> Vec<ExecutionAttempt> {
        self.attempts.read().clone()
    }

    /// Every recorded batch summary
    pub fn batches(&self) -> Vec<BatchJobRecord> {
        self.batches.read().clone()
    }
}

#[async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn record_attempt(&self, attempt: &ExecutionAttempt) -> Result<(), StoreError> {
        if !attempt.is_terminal() {
            return Err(StoreError::WriteFailed(format!(
                "attempt {} is still {}",
                attempt.request_index, attempt.status
            )));
        }
        self.attempts.write().push(attempt.clone());
        Ok(())
    }

    async fn record_batch(&self, record: &BatchJobRecord) -> Result<(), StoreError> {
        self.batches.write().push(record.clone());
        Ok(())
    }
}

#[async_trait]
impl ExecutionHistory for InMemoryExecutionStore {
    async fn attempts_for(&self, batch_id: Uuid) -> Vec<ExecutionAttempt> {
        let mut attempts: Vec<_> = self
            .attempts
            .read()
            .iter()
            .filter(|a| a.batch_id == batch_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.request_index);
        attempts
    }

    async fn batch(&self, batch_id: Uuid) -> Option<BatchJobRecord> {
        self.batches
            .read()
            .iter()
            .find(|b| b.batch_id == batch_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{AttemptStatus, ItemError, ItemErrorKind};

    #[tokio::test]
    async fn test_template_lookup() {
        let store = InMemoryTemplateStore::new();
        store.insert(TemplateDefinition::new("greet", "Hi {{name}}"));
        assert_eq!(store.get_template("greet").await.unwrap().body, "Hi {{name}}");
        assert_eq!(
            store.get_template("missing").await,
            Err(StoreError::TemplateNotFound("missing".into()))
        );
    }

    #[tokio::test]
    async fn test_only_terminal_attempts_are_recorded() {
        let store = InMemoryExecutionStore::new();
        let batch_id = Uuid::new_v4();
        let failed = ExecutionAttempt::rejected(
            batch_id,
            1,
            ItemError {
                kind: ItemErrorKind::Validation,
                code: "missing".into(),
                message: "name is required".into(),
            },
        );
        store.record_attempt(&failed).await.unwrap();

        let mut running = failed.clone();
        running.status = AttemptStatus::Running;
        assert!(store.record_attempt(&running).await.is_err());

        let history = store.attempts_for(batch_id).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, AttemptStatus::Failed);
        assert!(store.batch(batch_id).await.is_none());
    }
}
