//! Per-call retry policy for idempotent requests.

use std::time::Duration;

/// Retry policy applied to idempotent calls that fail transiently.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub attempts: u32,
    /// Base delay between attempts in milliseconds.
    pub delay_ms: u64,
    /// Double the delay after each failed attempt.
    pub exponential: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay_ms: 1000,
            exponential: true,
        }
    }
}

impl RetryPolicy {
    /// Calculate the delay after a given failed attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms = if self.exponential {
            self.delay_ms.saturating_mul(2u64.pow(attempt.min(32)))
        } else {
            self.delay_ms
        };
        Duration::from_millis(delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 3);
        assert_eq!(policy.delay_ms, 1000);
        assert!(policy.exponential);
    }

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(4000));
    }

    #[test]
    fn test_constant_delays() {
        let policy = RetryPolicy {
            attempts: 5,
            delay_ms: 250,
            exponential: false,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(250));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(250));
    }
}
