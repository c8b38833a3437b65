//! Failure classification for provider attempts
//!
//! Every way a provider attempt can fail is folded into one [`FailureInfo`]
//! before the retry policy sees it: a client fault, a non-success response,
//! a per-call timeout or an empty provider pool.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::types::{ItemError, ItemErrorKind};
use crate::provider::{ProviderError, ProviderResponse};

/// Whether a failure may go away on retry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureClass {
    /// May succeed on a later attempt
    Transient,
    /// Retrying cannot help
    Permanent,
}

/// A classified attempt failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    /// Category reported on the item
    pub kind: ItemErrorKind,
    /// Stable machine-readable code, matched by `retryable_codes`
    pub code: String,
    /// Human-readable detail
    pub message: String,
    /// Provider hint for the next attempt
    pub retry_after: Option<Duration>,
}

impl FailureInfo {
    /// Failure that the retry policy may retry
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ItemErrorKind::TransientProvider,
            code: code.into(),
            message: message.into(),
            retry_after: None,
        }
    }

    /// Failure that is never retried
    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: ItemErrorKind::PermanentProvider,
            code: code.into(),
            message: message.into(),
            retry_after: None,
        }
    }

    /// Every provider was disabled or unhealthy at dispatch time
    pub fn no_provider_available() -> Self {
        Self {
            kind: ItemErrorKind::NoProviderAvailable,
            code: "no_provider_available".to_string(),
            message: "no healthy provider was available at dispatch time".to_string(),
            retry_after: None,
        }
    }

    /// The per-call timeout in `ModelExecutionOptions` expired
    pub fn call_timeout(limit: Duration) -> Self {
        Self::from_error(&ProviderError::Timeout(limit))
    }

    /// Classify a fault raised by a provider client
    pub fn from_error(error: &ProviderError) -> Self {
        let kind = if error.is_permanent() {
            ItemErrorKind::PermanentProvider
        } else {
            ItemErrorKind::TransientProvider
        };
        Self {
            kind,
            code: error.code().to_string(),
            message: error.to_string(),
            retry_after: error.retry_after(),
        }
    }

    /// Classify a response whose `success` flag is false
    pub fn from_response(response: &ProviderResponse) -> Self {
        let message = response
            .error_message
            .clone()
            .unwrap_or_else(|| "provider reported failure".to_string());
        let code = response
            .error_code
            .clone()
            .unwrap_or_else(|| "provider_error".to_string());
        let mut info = if response.permanent {
            Self::permanent(code, message)
        } else {
            Self::transient(code, message)
        };
        info.retry_after = response.retry_after;
        info
    }

    /// Transient or permanent, from the kind
    pub fn class(&self) -> FailureClass {
        match self.kind {
            ItemErrorKind::PermanentProvider | ItemErrorKind::Validation => FailureClass::Permanent,
            _ => FailureClass::Transient,
        }
    }

    /// Shorthand for a permanent [`class`](Self::class)
    pub fn is_permanent(&self) -> bool {
        self.class() == FailureClass::Permanent
    }

    /// Drop the retry hint and keep what the item reports
    pub fn into_item_error(self) -> ItemError {
        ItemError {
            kind: self.kind,
            code: self.code,
            message: self.message,
        }
    }
}
