//! Model provider contracts
//!
//! A [`ProviderClient`] performs the actual network call to an LLM API. The
//! engine never talks to a provider directly; it goes through the
//! [`ProviderRegistry`], which also exposes the live health snapshot that the
//! [`DistributionSelector`] reads at dispatch time.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::batch::{CancellationSignal, ModelExecutionOptions};

pub mod distribution;
pub mod health;
pub mod registry;

pub use distribution::{DistributionSelector, DistributionStrategy, SelectionError, StrategySelector};
pub use health::{
    HealthConfig, InMemoryHealthTracker, ObservedOutcome, ProviderHealth, ProviderObservation,
    ProviderProfile,
};
pub use registry::ProviderRegistry;

/// Faults raised by a provider client
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// The call took longer than allowed
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The provider asked the caller to slow down
    #[error("Rate limited")]
    RateLimited {
        /// Wait requested by the provider
        retry_after: Option<Duration>,
    },

    /// Transport-level failure
    #[error("Network error: {0}")]
    Network(String),

    /// Credentials were rejected
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The provider rejected the request as invalid
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// The provider refused the content
    #[error("Content policy rejection: {0}")]
    ContentPolicy(String),

    /// Provider-specific failure
    #[error("Provider error [{code}]: {message}")]
    Other {
        /// Provider error code
        code: String,
        /// Provider error message
        message: String,
        /// Whether retrying is pointless
        permanent: bool,
    },

    /// The engine cancelled the call
    #[error("Request cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Permanent errors are never retried
    pub fn is_permanent(&self) -> bool {
        match self {
            ProviderError::Authentication(_)
            | ProviderError::MalformedRequest(_)
            | ProviderError::ContentPolicy(_) => true,
            ProviderError::Other { permanent, .. } => *permanent,
            _ => false,
        }
    }

    /// Stable error code, matched against retry allow-lists
    pub fn code(&self) -> &str {
        match self {
            ProviderError::Timeout(_) => "timeout",
            ProviderError::RateLimited { .. } => "rate_limited",
            ProviderError::Network(_) => "network",
            ProviderError::Authentication(_) => "authentication",
            ProviderError::MalformedRequest(_) => "malformed_request",
            ProviderError::ContentPolicy(_) => "content_policy",
            ProviderError::Other { code, .. } => code,
            ProviderError::Cancelled => "cancelled",
        }
    }

    /// Delay the provider asked for, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Result of one provider call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Whether the call produced content
    pub success: bool,
    /// Generated text
    pub content: Option<String>,
    /// Failure detail for unsuccessful responses
    pub error_message: Option<String>,
    /// Provider-specific error code for failed responses
    pub error_code: Option<String>,
    /// The failure will not go away on retry
    pub permanent: bool,
    /// Provider hint for the next attempt
    pub retry_after: Option<Duration>,
    /// Tokens consumed
    pub tokens_used: u64,
    /// Cost of this call
    pub cost_estimate: Option<f64>,
    /// Latency reported by the provider
    pub latency: Duration,
    /// Provider passthrough
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ProviderResponse {
    /// Successful response carrying `content`
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: Some(content.into()),
            ..Default::default()
        }
    }

    /// Transient failure response
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Failure response that is never retried
    pub fn permanent_failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_code: Some(code.into()),
            permanent: true,
            ..Self::failure(message)
        }
    }

    /// Attach a provider error code
    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }

    /// Ask the engine to wait before retrying
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    /// Set the token count
    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }

    /// Set the call cost
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost_estimate = Some(cost);
        self
    }

    /// Set the reported latency
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Add a passthrough metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Client for one configured provider
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Execute a resolved prompt
    ///
    /// Clients that can abort in-flight requests should watch `cancel`; the
    /// engine also stops awaiting the call once the signal fires.
    async fn execute(
        &self,
        prompt: &str,
        options: &ModelExecutionOptions,
        cancel: &CancellationSignal,
    ) -> Result<ProviderResponse, ProviderError>;
}

/// Read-only view of a provider's live state, as seen by the selector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHandle {
    /// Registered id
    pub id: String,
    /// Position in registration order, used to break ties
    pub registration_order: usize,
    /// Circuit closed
    pub healthy: bool,
    /// Administratively enabled
    pub enabled: bool,
    /// Calls currently in flight
    pub in_flight: usize,
    /// Smoothed latency of successful calls
    pub average_latency: Option<Duration>,
    /// Configured cost per request
    pub cost_per_request: Option<f64>,
    /// Completed calls
    pub total_requests: u64,
    /// Completed calls that failed
    pub failed_requests: u64,
}

impl ProviderHandle {
    /// Healthy, enabled and idle
    pub fn new(id: impl Into<String>, registration_order: usize) -> Self {
        Self {
            id: id.into(),
            registration_order,
            healthy: true,
            enabled: true,
            in_flight: 0,
            average_latency: None,
            cost_per_request: None,
            total_requests: 0,
            failed_requests: 0,
        }
    }

    /// Eligible for selection
    pub fn is_available(&self) -> bool {
        self.healthy && self.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(ProviderError::Authentication("bad key".into()).is_permanent());
        assert!(ProviderError::ContentPolicy("nope".into()).is_permanent());
        assert!(!ProviderError::Timeout(Duration::from_secs(1)).is_permanent());
        assert!(!ProviderError::RateLimited { retry_after: None }.is_permanent());
        assert_eq!(
            ProviderError::RateLimited { retry_after: Some(Duration::from_secs(2)) }.retry_after(),
            Some(Duration::from_secs(2))
        );
        let other = ProviderError::Other {
            code: "overloaded".into(),
            message: "busy".into(),
            permanent: false,
        };
        assert_eq!(other.code(), "overloaded");
    }

    #[test]
    fn test_response_builders() {
        let ok = ProviderResponse::success("hello").with_tokens(12).with_cost(0.01);
        assert!(ok.success);
        assert_eq!(ok.tokens_used, 12);

        let failed = ProviderResponse::permanent_failure("invalid_request", "bad prompt");
        assert!(!failed.success);
        assert!(failed.permanent);
        assert_eq!(failed.error_message.as_deref(), Some("bad prompt"));
    }
}
