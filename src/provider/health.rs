//! Live provider health tracking
//!
//! The tracker is the only writer of provider statistics. The engine reports
//! dispatches and outcomes; the selector reads snapshots. A per-provider
//! circuit opens after `failure_threshold` consecutive failures and keeps the
//! provider out of rotation for `cooldown`. After the cooldown the provider is
//! tried again: one success closes the circuit, one failure re-opens it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::ProviderHandle;

/// Circuit and latency settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive failures that mark a provider unhealthy; 0 disables the circuit
    pub failure_threshold: u32,
    /// How long an unhealthy provider stays out of rotation
    pub cooldown: Duration,
    /// Weight of the newest latency sample in the moving average (0, 1]
    pub latency_smoothing: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            latency_smoothing: 0.3,
        }
    }
}

/// Static per-provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderProfile {
    /// Used by the lowest-cost strategy
    pub cost_per_request: Option<f64>,
    /// Disabled providers are never selected
    pub enabled: bool,
}

impl Default for ProviderProfile {
    fn default() -> Self {
        Self {
            cost_per_request: None,
            enabled: true,
        }
    }
}

impl ProviderProfile {
    /// Set the per-request cost
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost_per_request = Some(cost);
        self
    }

    /// Register out of rotation
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// How an attempt ended, from the provider's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObservedOutcome {
    /// The call succeeded
    Success,
    /// The call failed or timed out
    Failure,
    /// Aborted by the engine; says nothing about the provider
    Cancelled,
}

/// What the engine observed for one call
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderObservation {
    /// Provider that served the call
    pub provider_id: String,
    /// How the call ended
    pub outcome: ObservedOutcome,
    /// Time from dispatch to outcome
    pub latency: Duration,
    /// Cost reported by the response, if any
    pub cost: Option<f64>,
}

/// Health-tracking collaborator
///
/// Implementations must tolerate concurrent writers.
pub trait ProviderHealth: Send + Sync {
    /// Start tracking a provider
    fn register_provider(&self, id: &str, profile: ProviderProfile);

    /// Current state of every tracked provider, in registration order
    fn snapshot(&self) -> Vec<ProviderHandle>;

    /// A call is about to be issued
    fn record_dispatch(&self, id: &str);

    /// A previously dispatched call has ended
    fn record_outcome(&self, observation: &ProviderObservation);
}

#[derive(Debug)]
struct HealthEntry {
    order: usize,
    profile: ProviderProfile,
    in_flight: usize,
    average_latency: Option<Duration>,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    total_requests: u64,
    failed_requests: u64,
}

/// Default in-process tracker
#[derive(Debug, Default)]
pub struct InMemoryHealthTracker {
    config: HealthConfig,
    entries: DashMap<String, HealthEntry>,
    next_order: AtomicUsize,
}

impl InMemoryHealthTracker {
    /// Tracker with the given thresholds
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            next_order: AtomicUsize::new(0),
        }
    }

    /// Take a provider in or out of rotation
    pub fn set_enabled(&self, id: &str, enabled: bool) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.profile.enabled = enabled;
            info!(provider_id = %id, enabled, "Provider availability changed");
        }
    }

    /// Open the circuit immediately
    pub fn trip(&self, id: &str) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.opened_at = Some(Instant::now());
            entry.consecutive_failures = entry.consecutive_failures.max(self.config.failure_threshold);
            warn!(provider_id = %id, "Provider circuit opened manually");
        }
    }

    fn is_healthy(&self, entry: &HealthEntry) -> bool {
        match entry.opened_at {
            None => true,
            Some(opened) => opened.elapsed() >= self.config.cooldown,
        }
    }

    fn blend_latency(&self, previous: Option<Duration>, sample: Duration) -> Duration {
        let alpha = self.config.latency_smoothing.clamp(f64::EPSILON, 1.0);
        match previous {
            None => sample,
            Some(prev) => Duration::from_secs_f64(
                prev.as_secs_f64() * (1.0 - alpha) + sample.as_secs_f64() * alpha,
            ),
        }
    }
}

impl ProviderHealth for InMemoryHealthTracker {
    fn register_provider(&self, id: &str, profile: ProviderProfile) {
        let order = self.next_order.fetch_add(1, Ordering::SeqCst);
        self.entries.insert(
            id.to_string(),
            HealthEntry {
                order,
                profile,
                in_flight: 0,
                average_latency: None,
                consecutive_failures: 0,
                opened_at: None,
                total_requests: 0,
                failed_requests: 0,
            },
        );
    }

    fn snapshot(&self) -> Vec<ProviderHandle> {
        let mut handles: Vec<ProviderHandle> = self
            .entries
            .iter()
            .map(|entry| ProviderHandle {
                id: entry.key().clone(),
                registration_order: entry.order,
                healthy: self.is_healthy(&entry),
                enabled: entry.profile.enabled,
                in_flight: entry.in_flight,
                average_latency: entry.average_latency,
                cost_per_request: entry.profile.cost_per_request,
                total_requests: entry.total_requests,
                failed_requests: entry.failed_requests,
            })
            .collect();
        handles.sort_by_key(|h| h.registration_order);
        handles
    }

    fn record_dispatch(&self, id: &str) {
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.in_flight += 1;
        }
    }

    fn record_outcome(&self, observation: &ProviderObservation) {
        let Some(mut entry) = self.entries.get_mut(&observation.provider_id) else {
            return;
        };
        entry.in_flight = entry.in_flight.saturating_sub(1);

        match observation.outcome {
            ObservedOutcome::Cancelled => {}
            ObservedOutcome::Success => {
                entry.total_requests += 1;
                entry.average_latency = Some(self.blend_latency(entry.average_latency, observation.latency));
                if entry.opened_at.is_some() {
                    info!(provider_id = %observation.provider_id, "Provider recovered");
                }
                entry.consecutive_failures = 0;
                entry.opened_at = None;
            }
            ObservedOutcome::Failure => {
                entry.total_requests += 1;
                entry.failed_requests += 1;
                entry.consecutive_failures += 1;
                let threshold = self.config.failure_threshold;
                if threshold > 0 && entry.consecutive_failures >= threshold {
                    if entry.opened_at.is_none() {
                        warn!(
                            provider_id = %observation.provider_id,
                            failures = entry.consecutive_failures,
                            "Provider marked unhealthy"
                        );
                    }
                    entry.opened_at = Some(Instant::now());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observation(id: &str, outcome: ObservedOutcome, ms: u64) -> ProviderObservation {
        ProviderObservation {
            provider_id: id.to_string(),
            outcome,
            latency: Duration::from_millis(ms),
            cost: None,
        }
    }

    #[test]
    fn test_snapshot_preserves_registration_order() {
        let tracker = InMemoryHealthTracker::new(HealthConfig::default());
        tracker.register_provider("zeta", ProviderProfile::default());
        tracker.register_provider("alpha", ProviderProfile::default().with_cost(0.5));
        let ids: Vec<_> = tracker.snapshot().into_iter().map(|h| h.id).collect();
        assert_eq!(ids, vec!["zeta", "alpha"]);
    }

    #[test]
    fn test_load_tracking() {
        let tracker = InMemoryHealthTracker::new(HealthConfig::default());
        tracker.register_provider("a", ProviderProfile::default());
        tracker.record_dispatch("a");
        tracker.record_dispatch("a");
        assert_eq!(tracker.snapshot()[0].in_flight, 2);
        tracker.record_outcome(&observation("a", ObservedOutcome::Cancelled, 0));
        assert_eq!(tracker.snapshot()[0].in_flight, 1);
        assert_eq!(tracker.snapshot()[0].total_requests, 0);
    }

    #[test]
    fn test_circuit_opens_and_recovers() {
        let tracker = InMemoryHealthTracker::new(HealthConfig {
            failure_threshold: 2,
            cooldown: Duration::from_millis(20),
            latency_smoothing: 0.5,
        });
        tracker.register_provider("a", ProviderProfile::default());

        for _ in 0..2 {
            tracker.record_dispatch("a");
            tracker.record_outcome(&observation("a", ObservedOutcome::Failure, 5));
        }
        assert!(!tracker.snapshot()[0].healthy);

        std::thread::sleep(Duration::from_millis(30));
        assert!(tracker.snapshot()[0].healthy);

        tracker.record_dispatch("a");
        tracker.record_outcome(&observation("a", ObservedOutcome::Success, 10));
        let handle = &tracker.snapshot()[0];
        assert!(handle.healthy);
        assert_eq!(handle.failed_requests, 2);
        assert_eq!(handle.average_latency, Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_latency_moving_average() {
        let tracker = InMemoryHealthTracker::new(HealthConfig {
            latency_smoothing: 0.5,
            ..Default::default()
        });
        tracker.register_provider("a", ProviderProfile::default());
        tracker.record_outcome(&observation("a", ObservedOutcome::Success, 100));
        tracker.record_outcome(&observation("a", ObservedOutcome::Success, 200));
        let avg = tracker.snapshot()[0].average_latency.unwrap();
        assert!((avg.as_secs_f64() - 0.15).abs() < 1e-6);
    }

    #[test]
    fn test_disable_and_trip() {
        let tracker = InMemoryHealthTracker::new(HealthConfig::default());
        tracker.register_provider("a", ProviderProfile::default());
        tracker.register_provider("b", ProviderProfile::default());
        tracker.set_enabled("a", false);
        tracker.trip("b");
        let snapshot = tracker.snapshot();
        assert!(!snapshot[0].is_available());
        assert!(!snapshot[1].is_available());
    }
}
