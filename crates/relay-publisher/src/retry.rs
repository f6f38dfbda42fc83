//! Exponential backoff for send-path failures.

use std::time::Duration;

use relay_config::PublisherConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_interval: Duration::from_secs(1),
            multiplier: 2.0,
            max_interval: Duration::from_secs(10),
        }
    }
}

impl From<&PublisherConfig> for RetryPolicy {
    fn from(config: &PublisherConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_interval: Duration::from_millis(config.initial_interval_ms),
            multiplier: config.multiplier,
            max_interval: Duration::from_millis(config.max_interval_ms),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Wait before 0-based `attempt`: nothing for the first, then
    /// `min(initial * multiplier^(attempt-1), max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let factor = self.multiplier.powi(exponent);
        let delay = self.initial_interval.as_secs_f64() * factor;
        if !delay.is_finite() || delay >= self.max_interval.as_secs_f64() {
            self.max_interval
        } else {
            Duration::from_secs_f64(delay)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sequence() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (0..policy.max_attempts())
            .map(|n| policy.delay_for(n).as_secs())
            .collect();
        assert_eq!(delays, vec![0, 1, 2, 4]);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(5), Duration::from_secs(10));
        assert_eq!(policy.delay_for(60), Duration::from_secs(10));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_from_config() {
        let config = PublisherConfig {
            max_retries: 5,
            initial_interval_ms: 100,
            multiplier: 3.0,
            max_interval_ms: 1_000,
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.max_attempts(), 6);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(300));
        assert_eq!(policy.delay_for(4), Duration::from_millis(1_000));
    }
}
