//! Retry policy and backoff delay.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::QueryError;

/// Default number of retries after the first failed attempt.
pub const DEFAULT_RETRIES: u32 = 3;

/// Default backoff base.
pub const DEFAULT_RETRY_BASE: Duration = Duration::from_millis(1_000);

type RetryPredicate = Arc<dyn Fn(u32, &QueryError) -> bool + Send + Sync>;
type DelayFn = Arc<dyn Fn(u32, &QueryError) -> Duration + Send + Sync>;

/// Whether a failed attempt may be retried.
///
/// ```
/// use forge_query_core::{QueryError, RetryPolicy};
///
/// let err = QueryError::loader("boom");
/// let policy = RetryPolicy::from(2u32);
/// assert!(policy.should_retry(1, &err));
/// assert!(policy.should_retry(2, &err));
/// assert!(!policy.should_retry(3, &err));
///
/// assert!(!RetryPolicy::from(false).should_retry(1, &err));
/// ```
#[derive(Clone)]
pub enum RetryPolicy {
    Never,
    /// Retry until this many retries have been made.
    UpTo(u32),
    /// Called with the number of failures so far and the latest error.
    Predicate(RetryPredicate),
}

impl RetryPolicy {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(u32, &QueryError) -> bool + Send + Sync + 'static,
    {
        RetryPolicy::Predicate(Arc::new(f))
    }

    /// `failures` counts failed attempts including the one that just happened.
    pub fn should_retry(&self, failures: u32, error: &QueryError) -> bool {
        match self {
            RetryPolicy::Never => false,
            RetryPolicy::UpTo(max) => failures <= *max,
            RetryPolicy::Predicate(f) => f(failures, error),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::UpTo(DEFAULT_RETRIES)
    }
}

impl From<bool> for RetryPolicy {
    fn from(retry: bool) -> Self {
        if retry {
            RetryPolicy::default()
        } else {
            RetryPolicy::Never
        }
    }
}

impl From<u32> for RetryPolicy {
    fn from(retries: u32) -> Self {
        RetryPolicy::UpTo(retries)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryPolicy::Never => f.write_str("Never"),
            RetryPolicy::UpTo(n) => f.debug_tuple("UpTo").field(n).finish(),
            RetryPolicy::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Delay before the next attempt.
#[derive(Clone)]
pub enum RetryDelay {
    /// `base * 2^failures` plus up to `base` of jitter, capped at `base * 10`.
    Exponential { base: Duration },
    Fixed(Duration),
    /// Called with the number of failed attempts so far and the latest error.
    Custom(DelayFn),
}

impl RetryDelay {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(u32, &QueryError) -> Duration + Send + Sync + 'static,
    {
        RetryDelay::Custom(Arc::new(f))
    }

    pub fn delay(&self, attempt: u32, error: &QueryError) -> Duration {
        match self {
            RetryDelay::Exponential { base } => exponential_backoff(*base, attempt),
            RetryDelay::Fixed(delay) => *delay,
            RetryDelay::Custom(f) => f(attempt, error),
        }
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        RetryDelay::Exponential {
            base: DEFAULT_RETRY_BASE,
        }
    }
}

impl From<Duration> for RetryDelay {
    fn from(delay: Duration) -> Self {
        RetryDelay::Fixed(delay)
    }
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryDelay::Exponential { base } => f
                .debug_struct("Exponential")
                .field("base", base)
                .finish(),
            RetryDelay::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            RetryDelay::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// `base * 2^attempt + jitter`, with jitter uniform in `[0, base)` and the total
/// capped at `base * 10`.
pub fn exponential_backoff(base: Duration, attempt: u32) -> Duration {
    let base_ms = crate::clock::as_millis(base);
    if base_ms == 0 {
        return Duration::ZERO;
    }
    let exp = base_ms.saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let jitter = fastrand::u64(0..base_ms);
    let cap = base_ms.saturating_mul(10);
    Duration::from_millis(exp.saturating_add(jitter).min(cap))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_allows_three_retries() {
        let err = QueryError::loader("x");
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(3, &err));
        assert!(!policy.should_retry(4, &err));
        assert!(matches!(RetryPolicy::from(true), RetryPolicy::UpTo(3)));
    }

    #[test]
    fn test_predicate_sees_failure_count() {
        let policy = RetryPolicy::predicate(|failures, err| {
            failures < 2 && !err.is_cancelled()
        });
        let err = QueryError::loader("x");
        assert!(policy.should_retry(1, &err));
        assert!(!policy.should_retry(2, &err));
        assert!(!policy.should_retry(1, &QueryError::Cancelled));
    }

    #[test]
    fn test_backoff_bounds() {
        let base = Duration::from_millis(100);
        for _ in 0..50 {
            let first = exponential_backoff(base, 0);
            assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(200));

            let second = exponential_backoff(base, 2);
            assert!(second >= Duration::from_millis(400) && second < Duration::from_millis(500));

            assert_eq!(exponential_backoff(base, 10), Duration::from_millis(1_000));
            assert_eq!(exponential_backoff(base, 200), Duration::from_millis(1_000));
        }
    }

    #[test]
    fn test_zero_base_has_no_delay() {
        assert_eq!(exponential_backoff(Duration::ZERO, 3), Duration::ZERO);
    }

    #[test]
    fn test_fixed_and_custom_delay() {
        let err = QueryError::loader("x");
        assert_eq!(
            RetryDelay::from(Duration::from_millis(5)).delay(9, &err),
            Duration::from_millis(5)
        );
        let custom = RetryDelay::custom(|attempt, _| Duration::from_millis(u64::from(attempt) * 7));
        assert_eq!(custom.delay(3, &err), Duration::from_millis(21));
    }
}
