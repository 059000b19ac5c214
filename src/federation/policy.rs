//! Delivery policy: retry budget, circuit breaker tuning and backoff

use std::sync::RwLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::FederationConfig;

/// Base delay before the first retry
pub const BACKOFF_BASE: Duration = Duration::from_secs(15);
/// Upper bound for any retry delay
pub const BACKOFF_CAP: Duration = Duration::from_secs(3600);
/// Longest accepted circuit cooldown (30 days)
pub const MAX_CIRCUIT_COOLDOWN_SECS: u64 = 30 * 24 * 3600;

/// Runtime-tunable delivery policy values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPolicy {
    pub max_retries: u32,
    pub circuit_failure_threshold: u32,
    pub circuit_cooldown_seconds: u64,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 6,
            circuit_failure_threshold: 5,
            circuit_cooldown_seconds: 300,
        }
    }
}

impl DeliveryPolicy {
    pub fn from_config(config: &FederationConfig) -> Self {
        let mut policy = Self::default();
        policy.apply(&PolicyUpdate {
            max_retries: Some(config.max_retry_count as i64),
            circuit_failure_threshold: Some(config.circuit_failure_threshold as i64),
            circuit_cooldown_seconds: Some(config.circuit_cooldown_seconds as i64),
        });
        policy
    }

    pub fn circuit_cooldown(&self) -> Duration {
        Duration::from_secs(self.circuit_cooldown_seconds)
    }

    /// Merge an update; absent or non-positive values leave a field unchanged
    pub fn apply(&mut self, update: &PolicyUpdate) {
        if let Some(value) = positive(update.max_retries) {
            self.max_retries = value.min(u32::MAX as u64) as u32;
        }
        if let Some(value) = positive(update.circuit_failure_threshold) {
            self.circuit_failure_threshold = value.min(u32::MAX as u64) as u32;
        }
        if let Some(value) = positive(update.circuit_cooldown_seconds) {
            self.circuit_cooldown_seconds = value.min(MAX_CIRCUIT_COOLDOWN_SECS);
        }
    }
}

fn positive(value: Option<i64>) -> Option<u64> {
    value.filter(|v| *v > 0).map(|v| v as u64)
}

/// Partial policy change as accepted by the admin API
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PolicyUpdate {
    pub max_retries: Option<i64>,
    pub circuit_failure_threshold: Option<i64>,
    pub circuit_cooldown_seconds: Option<i64>,
}

/// Shared policy cell; reads never wait on a delivery in flight
#[derive(Debug, Default)]
pub struct PolicyStore {
    inner: RwLock<DeliveryPolicy>,
}

impl PolicyStore {
    pub fn new(policy: DeliveryPolicy) -> Self {
        Self {
            inner: RwLock::new(policy),
        }
    }

    pub fn get(&self) -> DeliveryPolicy {
        match self.inner.read() {
            Ok(policy) => *policy,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Apply an update and return the resulting policy
    pub fn configure(&self, update: &PolicyUpdate) -> DeliveryPolicy {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.apply(update);
        *guard
    }
}

/// Delay before attempt `attempt` (1-indexed): `15s * 2^(attempt-1)`, capped at one hour
///
/// Attempts below 1 are treated as 1.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.max(1) - 1;
    // 15s * 2^8 already exceeds the cap
    if exponent >= 8 {
        return BACKOFF_CAP;
    }
    (BACKOFF_BASE * (1u32 << exponent)).min(BACKOFF_CAP)
}
