use std::time::Duration;

use rand::Rng;

/// Retry and backoff policy for the optimistic-concurrency coordinator.
///
/// Each version conflict sleeps an exponentially growing, jittered delay
/// before recomputing against fresh state; after `max_retries` conflicts the
/// operation fails instead of spinning forever.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Conflicts tolerated before giving up with `Exhausted`.
    pub max_retries: u32,
    /// First backoff delay; doubles per conflict.
    pub backoff_base: Duration,
    /// Upper bound on a single backoff delay.
    pub backoff_cap: Duration,
    /// Spread delays uniformly to avoid re-contending on the same slot in
    /// lockstep.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 20,
            backoff_base: Duration::from_millis(2),
            backoff_cap: Duration::from_millis(250),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Low-latency preset: short delays, more attempts.
    pub fn aggressive() -> Self {
        Self {
            max_retries: 50,
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(50),
            jitter: true,
        }
    }

    /// High-contention preset: generous budget, longer delays.
    pub fn patient() -> Self {
        Self {
            max_retries: 100,
            backoff_base: Duration::from_millis(5),
            backoff_cap: Duration::from_secs(1),
            jitter: true,
        }
    }

    /// Delay before the retry following conflict number `attempt`.
    pub(crate) fn backoff(&self, attempt: u32) -> Duration {
        let base = self.backoff_base.as_micros() as u64;
        let cap = self.backoff_cap.as_micros() as u64;
        let exp = base
            .saturating_mul(1u64 << attempt.min(20))
            .min(cap);
        let micros = if self.jitter && exp > 1 {
            rand::thread_rng().gen_range(exp / 2..=exp)
        } else {
            exp
        };
        Duration::from_micros(micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let config = RetryConfig {
            jitter: false,
            ..RetryConfig::default()
        };
        assert_eq!(config.backoff(0), Duration::from_millis(2));
        assert_eq!(config.backoff(1), Duration::from_millis(4));
        assert_eq!(config.backoff(10), Duration::from_millis(250));
        // Large attempt counts must not overflow the shift.
        assert_eq!(config.backoff(u32::MAX), Duration::from_millis(250));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let config = RetryConfig::default();
        for attempt in 0..8 {
            let upper = RetryConfig {
                jitter: false,
                ..config.clone()
            }
            .backoff(attempt);
            let delay = config.backoff(attempt);
            assert!(delay <= upper);
            assert!(delay >= upper / 2);
        }
    }
}
