//! Failure policy for evaluation jobs: a consecutive-failure budget per key
//! with exponential backoff + jitter between retries.
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use once_cell::sync::Lazy;
use opentelemetry::{global, metrics::Counter};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

static RETRIES_SCHEDULED: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter("pso-resilience")
        .u64_counter("pso_resilience_retries_scheduled_total")
        .with_description("Failed evaluations scheduled for another attempt")
        .init()
});

static ABANDONED: Lazy<Counter<u64>> = Lazy::new(|| {
    global::meter("pso-resilience")
        .u64_counter("pso_resilience_abandoned_total")
        .with_description("Keys abandoned after exhausting their failure budget")
        .init()
});

#[derive(Debug, Error, PartialEq)]
pub enum PolicyError {
    #[error("max_consecutive_failures must be at least 1")]
    ZeroBudget,
    #[error("jitter must lie within [0, 1], got {0}")]
    Jitter(f64),
    #[error("base delay {base_ms}ms exceeds max delay {max_ms}ms")]
    DelayOrder { base_ms: u64, max_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Failures in a row after which the key is abandoned.
    pub max_consecutive_failures: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64, // 0.0 - 1.0
}

impl Default for RetryPolicy {
    fn default() -> Self { Self { max_consecutive_failures: 3, base_delay_ms: 250, max_delay_ms: 30_000, jitter: 0.25 } }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.max_consecutive_failures == 0 { return Err(PolicyError::ZeroBudget); }
        if !(0.0..=1.0).contains(&self.jitter) { return Err(PolicyError::Jitter(self.jitter)); }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(PolicyError::DelayOrder { base_ms: self.base_delay_ms, max_ms: self.max_delay_ms });
        }
        Ok(())
    }

    /// Delay before attempt number `failures + 1`: `base * 2^(failures-1)`, capped, then jittered.
    pub fn backoff<R: Rng>(&self, failures: u32, rng: &mut R) -> Duration {
        if failures == 0 { return Duration::ZERO; }
        let exp = (self.base_delay_ms as f64) * 2f64.powi(failures.saturating_sub(1).min(30) as i32);
        let mut delay_ms = exp.min(self.max_delay_ms as f64);
        if self.jitter > 0.0 {
            delay_ms *= 1.0 + rng.gen_range(-self.jitter..=self.jitter);
        }
        Duration::from_millis(delay_ms.max(0.0) as u64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Retry { attempt: u32, delay: Duration },
    Abandon { failures: u32 },
}

/// Tracks consecutive failures per key and turns each new failure into a decision.
#[derive(Debug)]
pub struct FailureTracker<K> {
    policy: RetryPolicy,
    consecutive: HashMap<K, u32>,
}

impl<K: Hash + Eq + Clone + Debug> FailureTracker<K> {
    pub fn new(policy: RetryPolicy) -> Self { Self { policy, consecutive: HashMap::new() } }

    pub fn policy(&self) -> &RetryPolicy { &self.policy }

    pub fn failures(&self, key: &K) -> u32 { self.consecutive.get(key).copied().unwrap_or(0) }

    pub fn record_failure<R: Rng>(&mut self, key: &K, rng: &mut R) -> Decision {
        let count = self.consecutive.entry(key.clone()).or_insert(0);
        *count += 1;
        let failures = *count;
        if failures >= self.policy.max_consecutive_failures {
            ABANDONED.add(1, &[]);
            warn!(?key, failures, "failure_budget_exhausted");
            return Decision::Abandon { failures };
        }
        let delay = self.policy.backoff(failures, rng);
        RETRIES_SCHEDULED.add(1, &[]);
        debug!(?key, failures, delay_ms = delay.as_millis() as u64, "retry_scheduled");
        Decision::Retry { attempt: failures + 1, delay }
    }

    pub fn record_success(&mut self, key: &K) { self.consecutive.remove(key); }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn no_jitter() -> RetryPolicy { RetryPolicy { max_consecutive_failures: 4, base_delay_ms: 10, max_delay_ms: 35, jitter: 0.0 } }

    #[test]
    fn backoff_doubles_then_caps() {
        let p = no_jitter();
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(p.backoff(0, &mut rng), Duration::ZERO);
        assert_eq!(p.backoff(1, &mut rng), Duration::from_millis(10));
        assert_eq!(p.backoff(2, &mut rng), Duration::from_millis(20));
        assert_eq!(p.backoff(3, &mut rng), Duration::from_millis(35));
        assert_eq!(p.backoff(40, &mut rng), Duration::from_millis(35));
    }

    #[test]
    fn jitter_stays_in_band() {
        let p = RetryPolicy { jitter: 0.5, ..no_jitter() };
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..200 {
            let d = p.backoff(1, &mut rng).as_millis();
            assert!((5..=15).contains(&d), "delay {d}ms outside jitter band");
        }
    }

    #[test]
    fn tracker_abandons_after_budget_and_resets_on_success() {
        let mut t = FailureTracker::new(RetryPolicy { max_consecutive_failures: 2, ..no_jitter() });
        let mut rng = StdRng::seed_from_u64(3);
        assert!(matches!(t.record_failure(&7usize, &mut rng), Decision::Retry { attempt: 2, .. }));
        t.record_success(&7);
        assert_eq!(t.failures(&7), 0);
        assert!(matches!(t.record_failure(&7, &mut rng), Decision::Retry { .. }));
        assert_eq!(t.record_failure(&7, &mut rng), Decision::Abandon { failures: 2 });
        // other keys are independent
        assert_eq!(t.failures(&8), 0);
    }

    #[test]
    fn validate_rejects_bad_policies() {
        assert_eq!(RetryPolicy { max_consecutive_failures: 0, ..Default::default() }.validate(), Err(PolicyError::ZeroBudget));
        assert_eq!(RetryPolicy { jitter: 1.5, ..Default::default() }.validate(), Err(PolicyError::Jitter(1.5)));
        assert!(matches!(RetryPolicy { base_delay_ms: 10, max_delay_ms: 1, ..Default::default() }.validate(), Err(PolicyError::DelayOrder { .. })));
        assert!(RetryPolicy::default().validate().is_ok());
    }
}
