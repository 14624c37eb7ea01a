//! Lease and retry configuration (`spec.md` §6 "Configuration options").

use std::time::Duration;

/// `renewIntervalMs` must be strictly less than `leaseMs`, or a renewal could race
/// the lease's own expiration.
#[derive(Debug, Clone, Copy)]
pub struct LeaseConfig {
    pub lease_ms: i64,
    pub renew_interval_ms: i64,
}

impl LeaseConfig {
    pub fn new(lease_ms: i64, renew_interval_ms: i64) -> Self {
        assert!(
            renew_interval_ms < lease_ms,
            "renew_interval_ms ({renew_interval_ms}) must be less than lease_ms ({lease_ms})"
        );
        Self {
            lease_ms,
            renew_interval_ms,
        }
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_millis(self.renew_interval_ms.max(0) as u64)
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self::new(30_000, 10_000)
    }
}

/// Exponential backoff: `min(initial * multiplier^(attempt-1), max)`.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub initial_delay_ms: i64,
    pub multiplier: f64,
    pub max_delay_ms: i64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryConfig {
    /// `attempt` is 1-based, matching `Job::attempt` as incremented by `acquireJob`.
    pub fn delay_ms(&self, attempt: i32) -> i64 {
        let exponent = (attempt - 1).max(0);
        let raw = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        (raw as i64).min(self.max_delay_ms)
    }
}

/// Apply up to 10% jitter to a poll timer (`spec.md` §4.6 step 1).
pub fn jittered(duration: Duration) -> Duration {
    let millis = duration.as_millis() as i64;
    if millis <= 0 {
        return Duration::from_millis(0);
    }
    let jitter_span = (millis / 10).max(1);
    let jitter = fastrand::i64(0..=jitter_span) - jitter_span / 2;
    Duration::from_millis((millis + jitter).max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sequence_matches_retry_scenario() {
        let cfg = RetryConfig {
            initial_delay_ms: 10,
            multiplier: 2.0,
            max_delay_ms: 100,
        };
        let sequence: Vec<i64> = (1..=3).map(|attempt| cfg.delay_ms(attempt)).collect();
        assert_eq!(sequence, vec![10, 20, 40]);
    }

    #[test]
    fn backoff_is_capped_at_max_delay_ms() {
        let cfg = RetryConfig {
            initial_delay_ms: 10,
            multiplier: 2.0,
            max_delay_ms: 100,
        };
        assert_eq!(cfg.delay_ms(10), 100);
    }

    #[test]
    #[should_panic]
    fn lease_config_rejects_renew_interval_not_less_than_lease() {
        LeaseConfig::new(1_000, 1_000);
    }
}
