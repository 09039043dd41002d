//! Retry and backoff policies.
//!
//! [`RetryPolicy`] bounds publish attempts for a single envelope.
//! [`BackoffPolicy`] paces reconnect attempts against an external system.

use std::time::Duration;

use rand::Rng;

/// Bounded retry for one publish.
///
/// The delay after failed attempt `n` (1-based) is
/// `clamp(multiplier * 2^(n-1), min_delay, max_delay)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,

    /// Seconds multiplied by `2^(n-1)`.
    pub multiplier: f64,

    pub min_delay: Duration,

    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            multiplier: 0.2,
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after `attempt` failed, before the next one.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(62) as i32;
        let secs = self.multiplier * 2.0_f64.powi(exponent);
        let delay = if secs.is_finite() && secs > 0.0 {
            Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay)
        } else {
            Duration::ZERO
        };
        delay.max(self.min_delay).min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempt` failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Exponential backoff with jitter for reconnects.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(32) as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter_range = delay * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delays_follow_clamped_exponential() {
        let policy = RetryPolicy::default();

        // 0.2s and 0.4s are raised to the 0.5s floor.
        assert_eq!(policy.delay_after(1), Duration::from_millis(500));
        assert_eq!(policy.delay_after(2), Duration::from_millis(500));
        assert_eq!(policy.delay_after(3), Duration::from_millis(800));
        assert_eq!(policy.delay_after(5), Duration::from_millis(3200));
        assert_eq!(policy.delay_after(6), Duration::from_secs(5));
        assert_eq!(policy.delay_after(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_attempt_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_backoff_policy() {
        let policy = BackoffPolicy::default();

        let d0 = policy.delay(0);
        let d1 = policy.delay(1);
        let d2 = policy.delay(2);

        // Should increase exponentially (with some jitter variance)
        assert!(d0 <= Duration::from_millis(125));
        assert!(d1 <= Duration::from_millis(250));
        assert!(d2 >= Duration::from_millis(300) && d2 <= Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_max() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(5),
            jitter: 0.0,
        };

        assert_eq!(policy.delay(10), Duration::from_secs(5));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(5));
    }
}
