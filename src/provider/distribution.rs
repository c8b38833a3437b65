//! Provider selection strategies
//!
//! A selector sees the live [`ProviderHandle`] snapshot taken at dispatch time
//! and returns one available provider id. Unavailable providers (unhealthy or
//! disabled) are never picked. Ties always break toward the provider that was
//! registered first.

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ProviderHandle;

/// How the engine spreads requests over providers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionStrategy {
    /// Rotate through available providers
    #[default]
    RoundRobin,
    /// Lowest average latency; untried providers first
    FastestFirst,
    /// Fewest calls in flight
    LeastLoaded,
    /// Uniform choice among available providers
    Random,
    /// Cheapest per request; unpriced providers last
    LowestCost,
}

impl fmt::Display for DistributionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DistributionStrategy::RoundRobin => "round_robin",
            DistributionStrategy::FastestFirst => "fastest_first",
            DistributionStrategy::LeastLoaded => "least_loaded",
            DistributionStrategy::Random => "random",
            DistributionStrategy::LowestCost => "lowest_cost",
        };
        f.write_str(name)
    }
}

/// Selection failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    /// Every provider is disabled or unhealthy
    #[error("No provider is currently available")]
    NoProviderAvailable,
}

/// Picks a provider for the next dispatch
pub trait DistributionSelector: Send + Sync {
    /// Id of the provider to call next
    fn select(&self, providers: &[ProviderHandle]) -> Result<String, SelectionError>;
}

/// Built-in selector for every [`DistributionStrategy`]
pub struct StrategySelector {
    strategy: DistributionStrategy,
    cursor: AtomicUsize,
    rng: Mutex<StdRng>,
}

impl fmt::Debug for StrategySelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrategySelector")
            .field("strategy", &self.strategy)
            .field("cursor", &self.cursor.load(Ordering::Relaxed))
            .finish()
    }
}

impl StrategySelector {
    /// Selector with entropy-seeded randomness
    pub fn new(strategy: DistributionStrategy) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Deterministic random selection, for reproducible runs
    pub fn with_seed(strategy: DistributionStrategy, seed: u64) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Strategy this selector applies
    pub fn strategy(&self) -> DistributionStrategy {
        self.strategy
    }

    fn round_robin<'a>(&self, providers: &'a [ProviderHandle]) -> Option<&'a ProviderHandle> {
        let n = providers.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
        (0..n)
            .map(|offset| &providers[(start + offset) % n])
            .find(|p| p.is_available())
    }

    fn random<'a>(&self, available: &[&'a ProviderHandle]) -> &'a ProviderHandle {
        let index = self.rng.lock().gen_range(0..available.len());
        available[index]
    }
}

// Unknown latency sorts first so new providers get measured.
fn latency_key(handle: &ProviderHandle) -> Duration {
    handle.average_latency.unwrap_or(Duration::ZERO)
}

// Unknown cost sorts last.
fn compare_cost(a: &ProviderHandle, b: &ProviderHandle) -> CmpOrdering {
    match (a.cost_per_request, b.cost_per_request) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => CmpOrdering::Less,
        (None, Some(_)) => CmpOrdering::Greater,
        (None, None) => CmpOrdering::Equal,
    }
}

impl DistributionSelector for StrategySelector {
    fn select(&self, providers: &[ProviderHandle]) -> Result<String, SelectionError> {
        if providers.is_empty() {
            return Err(SelectionError::NoProviderAvailable);
        }

        let available: Vec<&ProviderHandle> =
            providers.iter().filter(|p| p.is_available()).collect();
        if available.is_empty() {
            return Err(SelectionError::NoProviderAvailable);
        }

        // `min_by` keeps the first of equal elements, so ties go to the
        // earliest registered provider.
        let chosen = match self.strategy {
            DistributionStrategy::RoundRobin => self.round_robin(providers),
            DistributionStrategy::FastestFirst => {
                available.iter().copied().min_by_key(|p| latency_key(p))
            }
            DistributionStrategy::LeastLoaded => available.iter().copied().min_by_key(|p| p.in_flight),
            DistributionStrategy::LowestCost => {
                available.iter().copied().min_by(|a, b| compare_cost(a, b))
            }
            DistributionStrategy::Random => Some(self.random(&available)),
        };

        chosen
            .map(|p| p.id.clone())
            .ok_or(SelectionError::NoProviderAvailable)
    }
}
