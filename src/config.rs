//! Engine configuration
//!
//! One JSON document configures batch defaults, provider health tracking and
//! CSV parsing. Every section is optional and falls back to its defaults.
//!
//! ```json
//! {
//!   "batch": { "max_concurrency": 8, "distribution_strategy": "least_loaded" },
//!   "health": { "failure_threshold": 3 },
//!   "csv": { "delimiter": ";" }
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::batch::BatchModelExecutionOptions;
use crate::provider::HealthConfig;
use crate::tabular::CsvParseOptions;
use crate::{PromptRunError, Result};

/// Engine configuration, loadable from JSON
///
/// Every section is optional and falls back to its defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Defaults for batch execution
    pub batch: BatchModelExecutionOptions,
    /// Circuit breaker and latency smoothing
    pub health: HealthConfig,
    /// Defaults for CSV input
    pub csv: CsvParseOptions,
}

impl EngineConfig {
    /// Parse and validate
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON file, then parse and validate it
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            PromptRunError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "Loading engine configuration");
        Self::from_json_str(&text)
    }

    /// Check every section
    pub fn validate(&self) -> Result<()> {
        self.batch.validate()?;
        if !(self.health.latency_smoothing > 0.0 && self.health.latency_smoothing <= 1.0) {
            return Err(PromptRunError::Configuration(format!(
                "latency_smoothing must be in (0, 1], got {}",
                self.health.latency_smoothing
            )));
        }
        if !self.csv.delimiter.is_ascii() {
            return Err(PromptRunError::Configuration(format!(
                "CSV delimiter {:?} must be ASCII",
                self.csv.delimiter
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::DistributionStrategy;
    use std::time::Duration;

    #[test]
    fn test_partial_document_uses_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{
                "batch": { "max_concurrency": 8, "distribution_strategy": "least_loaded" },
                "health": { "failure_threshold": 3 },
                "csv": { "delimiter": ";" }
            }"#,
        )
        .unwrap();

        assert_eq!(config.batch.max_concurrency, 8);
        assert_eq!(config.batch.distribution_strategy, DistributionStrategy::LeastLoaded);
        assert_eq!(config.batch.execution.retry.max_retries, 3);
        assert_eq!(config.health.failure_threshold, 3);
        assert_eq!(config.health.cooldown, Duration::from_secs(30));
        assert_eq!(config.csv.delimiter, ';');
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(EngineConfig::from_json_str(r#"{"batch": {"max_concurrency": 0}}"#).is_err());
        assert!(EngineConfig::from_json_str(r#"{"csv": {"delimiter": "§"}}"#).is_err());
        assert!(EngineConfig::from_json_str(r#"{"health": {"latency_smoothing": 0.0}}"#).is_err());
        assert!(matches!(
            EngineConfig::from_json_str("not json"),
            Err(PromptRunError::Serialization(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = EngineConfig::from_file("/nonexistent/promptrun.json").unwrap_err();
        assert!(matches!(err, PromptRunError::Configuration(_)));
    }
}
