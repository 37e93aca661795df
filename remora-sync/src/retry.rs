//! Retry policy for engine restarts

use std::time::Duration;

use crate::errors::SyncError;

/// What to do after a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAdvice {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryAdvice {
    pub fn stop() -> Self {
        Self {
            retry: false,
            delay: Duration::ZERO,
        }
    }

    pub fn after(delay: Duration) -> Self {
        Self { retry: true, delay }
    }
}

/// Decides whether a failed engine run should be restarted, and how long to
/// wait first.
pub trait RetryPolicy: Send + Sync {
    fn advise(&self, error: &SyncError, attempt: u32) -> RetryAdvice;
}

/// Deterministic doubling backoff capped at `max_delay`. Non-retryable
/// errors always stop, as does exhausting `max_attempts`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ExponentialBackoff {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(8, Duration::from_millis(200), Duration::from_secs(30))
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn advise(&self, error: &SyncError, attempt: u32) -> RetryAdvice {
        if !error.is_retryable() || attempt >= self.max_attempts {
            return RetryAdvice::stop();
        }
        RetryAdvice::after(self.delay_for_attempt(attempt))
    }
}

/// Always stops. Useful for tests and one-shot runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn advise(&self, _error: &SyncError, _attempt: u32) -> RetryAdvice {
        RetryAdvice::stop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retryable() -> SyncError {
        SyncError::Transport {
            message: "connection reset".to_string(),
            retryable: true,
        }
    }

    #[test]
    fn delays_double_and_cap() {
        let policy =
            ExponentialBackoff::new(10, Duration::from_millis(100), Duration::from_millis(500));

        assert_eq!(policy.advise(&retryable(), 0).delay, Duration::from_millis(100));
        assert_eq!(policy.advise(&retryable(), 1).delay, Duration::from_millis(200));
        assert_eq!(policy.advise(&retryable(), 2).delay, Duration::from_millis(400));
        assert_eq!(policy.advise(&retryable(), 3).delay, Duration::from_millis(500));
        assert_eq!(policy.advise(&retryable(), 9).delay, Duration::from_millis(500));
    }

    #[test]
    fn stops_on_non_retryable_errors() {
        let policy = ExponentialBackoff::default();
        let advice = policy.advise(&SyncError::InvariantViolation("bad".to_string()), 0);
        assert!(!advice.retry);
    }

    #[test]
    fn stops_after_max_attempts() {
        let policy = ExponentialBackoff::new(3, Duration::from_millis(1), Duration::from_secs(1));
        assert!(policy.advise(&retryable(), 2).retry);
        assert!(!policy.advise(&retryable(), 3).retry);
    }
}
