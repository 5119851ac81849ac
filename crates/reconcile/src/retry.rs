//! Retry logic with exponential backoff for provider calls.
//!
//! Nothing is retried by default. A resource type opts in by listing the
//! error categories it considers safe to retry.

use crate::error::{ErrorCategory, ProviderError};
use crate::model::ResourceKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::thread;
use std::time::Duration;

/// Per-type retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Categories that may be retried
    pub retry_on: BTreeSet<ErrorCategory>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::no_retry()
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
            retry_on: BTreeSet::new(),
        }
    }

    /// Retry the given categories up to `max_attempts` times in total.
    pub fn retrying(max_attempts: u32, retry_on: impl IntoIterator<Item = ErrorCategory>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            retry_on: retry_on.into_iter().collect(),
            ..Self::no_retry()
        }
    }

    pub fn with_delays(mut self, base_delay: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.max_delay = max_delay;
        self
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay)
    }

    pub fn is_retryable(&self, error: &ProviderError) -> bool {
        self.retry_on.contains(&error.category())
    }
}

/// Result of a retried operation together with the attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, ProviderError>,
    pub attempts: u32,
}

/// Execute a provider operation with retry.
///
/// Errors whose category is not listed in `retry_on` are returned at once.
/// Retryable errors back off exponentially until `max_attempts` is reached,
/// after which the last error is returned.
pub fn with_retry<T, F>(policy: &RetryPolicy, key: &ResourceKey, mut operation: F) -> Attempted<T>
where
    F: FnMut() -> Result<T, ProviderError>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation() {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                };
            }
            Err(e) if attempt < max_attempts && policy.is_retryable(&e) => {
                let delay = policy.delay_for_attempt(attempt - 1);
                log::warn!(
                    "{key}: attempt {attempt}/{max_attempts} failed ({}): {e}. Retrying in {delay:?}",
                    e.category()
                );
                thread::sleep(delay);
            }
            Err(e) => {
                return Attempted {
                    result: Err(e),
                    attempts: attempt,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn key() -> ResourceKey {
        ResourceKey::new("network", "vpc1")
    }

    fn fast(max_attempts: u32, retry_on: impl IntoIterator<Item = ErrorCategory>) -> RetryPolicy {
        RetryPolicy::retrying(max_attempts, retry_on)
            .with_delays(Duration::from_millis(1), Duration::from_millis(5))
    }

    fn throttled() -> ProviderError {
        ProviderError::Throttled {
            message: "slow down".to_string(),
        }
    }

    #[test]
    fn test_default_makes_one_attempt() {
        let calls = Cell::new(0);
        let outcome: Attempted<()> = with_retry(&RetryPolicy::default(), &key(), || {
            calls.set(calls.get() + 1);
            Err(throttled())
        });
        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_eventual_success() {
        let calls = Cell::new(0);
        let outcome = with_retry(&fast(3, [ErrorCategory::Throttled]), &key(), || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 { Err(throttled()) } else { Ok(42) }
        });
        assert_eq!(outcome.result.unwrap(), 42);
        assert_eq!(outcome.attempts, 3);
    }

    #[test]
    fn test_unlisted_category_is_not_retried() {
        let calls = Cell::new(0);
        let outcome: Attempted<()> = with_retry(&fast(5, [ErrorCategory::Throttled]), &key(), || {
            calls.set(calls.get() + 1);
            Err(ProviderError::Rejected {
                message: "bad cidr".to_string(),
            })
        });
        assert_eq!(outcome.result.unwrap_err().category(), ErrorCategory::Rejected);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_all_attempts_fail() {
        let outcome: Attempted<()> =
            with_retry(&fast(3, [ErrorCategory::Throttled]), &key(), || Err(throttled()));
        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 3);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_delay: Duration::from_millis(500),
            retry_on: BTreeSet::new(),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(8), Duration::from_millis(500));
    }
}
