//! Retry policies consulted by invokers and coordination primitives.
//!
//! Policies are stateless: every decision is a pure function of the attempt
//! count, the last error and (for jitter) a random draw, so one instance can be
//! shared freely across concurrent callers.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Lowest exponent used by [`ExponentialBackoff`]; the first retry waits 2^6 = 64ms.
const MIN_EXPONENT: u32 = 6;
/// Attempt counts above this are clamped before exponentiation.
const MAX_ATTEMPT_EXPONENT: u32 = 26;
/// Delays below this are too small for jitter to be meaningful.
const JITTER_FLOOR: Duration = Duration::from_millis(100);

/// Outcome of a retry consultation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    /// Do not retry.
    pub const STOP: Self = Self {
        retry: false,
        delay: Duration::ZERO,
    };

    /// Retry after `delay`.
    #[must_use]
    pub fn after(delay: Duration) -> Self {
        Self { retry: true, delay }
    }
}

/// Strategy deciding whether (and after how long) a failed operation is retried.
pub trait RetryPolicy: Send + Sync {
    /// `attempt_count` is the number of attempts already made (starting at 1).
    fn should_retry(&self, attempt_count: u32, last_error: &ProtocolError) -> RetryDecision;
}

/// Policy that never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn should_retry(&self, _attempt_count: u32, _last_error: &ProtocolError) -> RetryDecision {
        RetryDecision::STOP
    }
}

/// Settings for [`ExponentialBackoff`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Largest attempt count that may still be retried. Zero disables retries.
    pub max_retries: u32,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Scale each delay by a random factor in `[0.95, 1.05]`.
    pub use_jitter: bool,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 5,
            max_delay: Duration::from_secs(30),
            use_jitter: true,
        }
    }
}

/// Exponential backoff with optional jitter.
///
/// `delay = min(2^(min(attempt, 26) + 6) ms, max_delay)`.
#[derive(Debug, Clone, Default)]
pub struct ExponentialBackoff {
    options: RetryOptions,
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(options: RetryOptions) -> Self {
        Self { options }
    }

    #[must_use]
    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    /// Delay before the retry following `attempt_count` failed attempts, before jitter.
    #[must_use]
    pub fn base_delay(&self, attempt_count: u32) -> Duration {
        let exponent = attempt_count.min(MAX_ATTEMPT_EXPONENT) + MIN_EXPONENT;
        let millis = 1u64 << exponent;
        Duration::from_millis(millis).min(self.options.max_delay)
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn should_retry(&self, attempt_count: u32, last_error: &ProtocolError) -> RetryDecision {
        if self.options.max_retries == 0 || attempt_count > self.options.max_retries {
            return RetryDecision::STOP;
        }
        if !last_error.is_transient() {
            return RetryDecision::STOP;
        }

        let delay = self.base_delay(attempt_count);
        if !self.options.use_jitter || delay < JITTER_FLOOR {
            return RetryDecision::after(delay);
        }

        let factor: f64 = rand::rng().random_range(0.95..=1.05);
        RetryDecision::after(delay.mul_f64(factor))
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn timeout_err() -> ProtocolError {
        ProtocolError::timeout("CommandTimeout", Duration::from_secs(1))
    }

    fn no_jitter(max_retries: u32, max_delay: Duration) -> ExponentialBackoff {
        ExponentialBackoff::new(RetryOptions {
            max_retries,
            max_delay,
            use_jitter: false,
        })
    }

    #[test]
    fn first_retry_starts_above_floor() {
        let policy = no_jitter(5, Duration::from_secs(30));
        let decision = policy.should_retry(1, &timeout_err());
        assert_eq!(decision, RetryDecision::after(Duration::from_millis(128)));
        assert_eq!(policy.base_delay(0), Duration::from_millis(64));
    }

    #[test]
    fn delays_cap_at_max_delay() {
        let policy = no_jitter(100, Duration::from_secs(2));
        let decision = policy.should_retry(50, &timeout_err());
        assert_eq!(decision.delay, Duration::from_secs(2));
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let policy = no_jitter(u32::MAX, Duration::MAX);
        let decision = policy.should_retry(u32::MAX, &timeout_err());
        assert!(decision.retry);
        assert_eq!(decision.delay, Duration::from_millis(1 << 32));
    }

    #[test]
    fn zero_max_retries_disables_retry() {
        let policy = no_jitter(0, Duration::from_secs(30));
        assert_eq!(policy.should_retry(1, &timeout_err()), RetryDecision::STOP);
    }

    #[test]
    fn stops_after_max_retries() {
        let policy = no_jitter(3, Duration::from_secs(30));
        assert!(policy.should_retry(3, &timeout_err()).retry);
        assert_eq!(policy.should_retry(4, &timeout_err()), RetryDecision::STOP);
    }

    #[test]
    fn non_transient_errors_are_not_retried() {
        let policy = no_jitter(3, Duration::from_secs(30));
        let err = ProtocolError::execution_exception("boom");
        assert_eq!(policy.should_retry(1, &err), RetryDecision::STOP);
    }

    #[test]
    fn jitter_stays_within_five_percent() {
        let policy = ExponentialBackoff::new(RetryOptions {
            max_retries: 10,
            max_delay: Duration::from_secs(60),
            use_jitter: true,
        });
        let base = policy.base_delay(4);
        for _ in 0..100 {
            let delay = policy.should_retry(4, &timeout_err()).delay;
            assert!(delay >= base.mul_f64(0.95) && delay <= base.mul_f64(1.05));
        }
    }

    #[test]
    fn jitter_skipped_for_small_delays() {
        let policy = ExponentialBackoff::new(RetryOptions {
            max_retries: 10,
            max_delay: Duration::from_millis(20),
            use_jitter: true,
        });
        for _ in 0..20 {
            assert_eq!(policy.should_retry(1, &timeout_err()).delay, Duration::from_millis(20));
        }
    }

    #[test]
    fn no_retry_policy_declines() {
        assert_eq!(NoRetry.should_retry(1, &timeout_err()), RetryDecision::STOP);
    }

    proptest! {
        #[test]
        fn delays_are_monotonic_until_max(max_retries in 1u32..64, max_delay_ms in 1u64..120_000) {
            let policy = no_jitter(max_retries, Duration::from_millis(max_delay_ms));
            let mut previous = Duration::ZERO;
            for attempt in 1..=max_retries {
                let decision = policy.should_retry(attempt, &timeout_err());
                prop_assert!(decision.retry);
                prop_assert!(decision.delay >= previous);
                prop_assert!(decision.delay <= Duration::from_millis(max_delay_ms));
                previous = decision.delay;
            }
            prop_assert_eq!(policy.should_retry(max_retries + 1, &timeout_err()), RetryDecision::STOP);
        }
    }
}
