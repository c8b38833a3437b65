//! Retry policy
//!
//! Attempt numbers are 1-based. An item may be retried while the attempt that
//! just failed is within the `max_retries` budget, so a budget of 3 allows at
//! most 4 calls. In exponential mode the delay before retry `n` is
//! `base_delay * 2^(n-1)`, optionally stretched by up to 10% of jitter and then
//! capped at `max_delay`.

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::error_handling::FailureInfo;
use super::types::ItemErrorKind;
use crate::{PromptRunError, Result};

/// Per-item retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Retries after the first attempt; 0 disables retry
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Double the delay on every further retry
    pub use_exponential_backoff: bool,
    /// Ceiling for any single delay; `None` leaves backoff uncapped
    pub max_delay: Option<Duration>,
    /// Add up to 10% random delay
    pub jitter: bool,
    /// When non-empty, only transient failures with one of these codes are retried
    pub retryable_error_codes: Vec<String>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            use_exponential_backoff: true,
            max_delay: Some(Duration::from_secs(60)),
            jitter: false,
            retryable_error_codes: Vec::new(),
        }
    }
}

impl RetryOptions {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Set the retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the first retry delay
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Toggle exponential backoff
    pub fn with_exponential_backoff(mut self, enabled: bool) -> Self {
        self.use_exponential_backoff = enabled;
        self
    }

    /// Cap each delay
    pub fn with_max_delay(mut self, max_delay: Option<Duration>) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Toggle jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Only retry transient failures whose code is listed
    pub fn with_retryable_codes<I, S>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retryable_error_codes = codes.into_iter().map(Into::into).collect();
        self
    }

    /// Reject delays the policy cannot honour
    pub fn validate(&self) -> Result<()> {
        if let Some(max) = self.max_delay {
            if max < self.base_delay {
                return Err(PromptRunError::Configuration(format!(
                    "retry max_delay {:?} is shorter than base_delay {:?}",
                    max, self.base_delay
                )));
            }
        }
        Ok(())
    }

    /// Delay before the retry that follows failed attempt `attempt`, before jitter and cap
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        if !self.use_exponential_backoff {
            return self.base_delay;
        }
        let exponent = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue the item after `delay`
    Retry {
        /// Backoff before the item is requeued
        delay: Duration,
    },
    /// The failure is final
    GiveUp,
}

/// Decides whether and when a failed attempt is retried
pub trait RetryPolicy: Send + Sync {
    /// `attempt` counts from 1 for the first call
    fn decide(&self, attempt: u32, failure: &FailureInfo) -> RetryDecision;
}

/// [`RetryPolicy`] driven by [`RetryOptions`]
pub struct BackoffRetryPolicy {
    options: RetryOptions,
    rng: Mutex<StdRng>,
}

impl fmt::Debug for BackoffRetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackoffRetryPolicy")
            .field("options", &self.options)
            .finish()
    }
}

impl BackoffRetryPolicy {
    /// Policy with entropy-seeded jitter
    pub fn new(options: RetryOptions) -> Self {
        Self {
            options,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Seeded jitter, for reproducible runs
    pub fn with_seed(options: RetryOptions, seed: u64) -> Self {
        Self {
            options,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Options this policy was built from
    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    fn is_retryable(&self, failure: &FailureInfo) -> bool {
        if failure.is_permanent() {
            return false;
        }
        let allow = &self.options.retryable_error_codes;
        failure.kind == ItemErrorKind::NoProviderAvailable
            || allow.is_empty()
            || allow.iter().any(|code| code == &failure.code)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.options.jitter || delay.is_zero() {
            return delay;
        }
        let fraction: f64 = self.rng.lock().gen::<f64>() * 0.1;
        delay + delay.mul_f64(fraction)
    }

    fn capped(&self, delay: Duration) -> Duration {
        match self.options.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        }
    }
}

impl RetryPolicy for BackoffRetryPolicy {
    fn decide(&self, attempt: u32, failure: &FailureInfo) -> RetryDecision {
        if !self.is_retryable(failure) || attempt > self.options.max_retries {
            return RetryDecision::GiveUp;
        }

        let delay = match failure.retry_after {
            Some(hint) => hint,
            None => self.jittered(self.options.raw_delay(attempt)),
        };
        RetryDecision::Retry {
            delay: self.capped(delay),
        }
    }
}
