//! Provider registration

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use super::health::{HealthConfig, InMemoryHealthTracker, ProviderHealth, ProviderProfile};
use super::{ProviderClient, ProviderHandle};
use crate::{PromptRunError, Result};

struct RegisteredProvider {
    id: String,
    client: Arc<dyn ProviderClient>,
}

/// Configured providers, in registration order, plus their health tracker
pub struct ProviderRegistry {
    providers: Vec<RegisteredProvider>,
    health: Arc<dyn ProviderHealth>,
}

impl fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.ids())
            .finish()
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderRegistry {
    /// Registry backed by an [`InMemoryHealthTracker`] with default settings
    pub fn new() -> Self {
        Self::with_health(Arc::new(InMemoryHealthTracker::new(HealthConfig::default())))
    }

    /// Registry backed by an external health collaborator
    pub fn with_health(health: Arc<dyn ProviderHealth>) -> Self {
        Self {
            providers: Vec::new(),
            health,
        }
    }

    /// Register with the default profile
    pub fn register(&mut self, id: impl Into<String>, client: Arc<dyn ProviderClient>) -> Result<()> {
        self.register_with_profile(id, client, ProviderProfile::default())
    }

    /// Register a client under a unique, non-empty id
    pub fn register_with_profile(
        &mut self,
        id: impl Into<String>,
        client: Arc<dyn ProviderClient>,
        profile: ProviderProfile,
    ) -> Result<()> {
        let id = id.into();
        if id.is_empty() {
            return Err(PromptRunError::Configuration("provider id must not be empty".into()));
        }
        if self.client(&id).is_some() {
            return Err(PromptRunError::Configuration(format!(
                "provider '{}' is already registered",
                id
            )));
        }

        debug!(provider_id = %id, "Registering provider");
        self.health.register_provider(&id, profile);
        self.providers.push(RegisteredProvider { id, client });
        Ok(())
    }

    /// Builder-style registration
    pub fn with_provider(mut self, id: impl Into<String>, client: Arc<dyn ProviderClient>) -> Result<Self> {
        self.register(id, client)?;
        Ok(self)
    }

    /// Client registered under `id`
    pub fn client(&self, id: &str) -> Option<Arc<dyn ProviderClient>> {
        self.providers
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.client.clone())
    }

    /// Registered ids, in registration order
    pub fn ids(&self) -> Vec<&str> {
        self.providers.iter().map(|p| p.id.as_str()).collect()
    }

    /// Number of registered providers
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether no provider is registered
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Tracker shared by every registered provider
    pub fn health(&self) -> &Arc<dyn ProviderHealth> {
        &self.health
    }

    /// Live snapshot of registered providers, in registration order
    pub fn snapshot(&self) -> Vec<ProviderHandle> {
        let mut snapshot: Vec<ProviderHandle> = self
            .health
            .snapshot()
            .into_iter()
            .filter(|h| self.client(&h.id).is_some())
            .collect();
        snapshot.sort_by_key(|h| {
            self.providers
                .iter()
                .position(|p| p.id == h.id)
                .unwrap_or(usize::MAX)
        });
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{CancellationSignal, ModelExecutionOptions};
    use crate::provider::{ProviderError, ProviderResponse};
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl ProviderClient for Echo {
        async fn execute(
            &self,
            prompt: &str,
            _options: &ModelExecutionOptions,
            _cancel: &CancellationSignal,
        ) -> std::result::Result<ProviderResponse, ProviderError> {
            Ok(ProviderResponse::success(prompt))
        }
    }

    #[test]
    fn test_registration_order_and_duplicates() {
        let mut registry = ProviderRegistry::new();
        registry.register("b", Arc::new(Echo)).unwrap();
        registry.register("a", Arc::new(Echo)).unwrap();
        assert!(registry.register("a", Arc::new(Echo)).is_err());
        assert!(registry.register("", Arc::new(Echo)).is_err());

        assert_eq!(registry.ids(), vec!["b", "a"]);
        let snapshot: Vec<_> = registry.snapshot().into_iter().map(|h| h.id).collect();
        assert_eq!(snapshot, vec!["b", "a"]);
    }

    #[test]
    fn test_client_lookup_executes() {
        let registry = ProviderRegistry::new().with_provider("echo", Arc::new(Echo)).unwrap();
        let client = registry.client("echo").unwrap();
        let response = tokio_test::block_on(client.execute(
            "ping",
            &ModelExecutionOptions::default(),
            &CancellationSignal::new(),
        ))
        .unwrap();
        assert_eq!(response.content.as_deref(), Some("ping"));
        assert!(registry.client("missing").is_none());
    }
}
