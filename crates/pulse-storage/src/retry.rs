//! Shared retry controller: bounded retries with exponential backoff.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Errors the [`RetryPolicy`] can classify.
pub trait Retryable {
    fn disposition(&self) -> RetryDisposition;

    fn is_retryable(&self) -> bool {
        self.disposition() == RetryDisposition::Retryable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("non-retryable failure after {attempts} attempt(s): {error}")]
    Fatal { error: E, attempts: usize },
    #[error("retries exhausted after {attempts} attempt(s): {error}")]
    Exhausted { error: E, attempts: usize },
}

impl<E> RetryError<E> {
    pub fn error(&self) -> &E {
        match self {
            RetryError::Fatal { error, .. } | RetryError::Exhausted { error, .. } => error,
        }
    }

    pub fn into_error(self) -> E {
        match self {
            RetryError::Fatal { error, .. } | RetryError::Exhausted { error, .. } => error,
        }
    }

    pub fn attempts(&self) -> usize {
        match self {
            RetryError::Fatal { attempts, .. } | RetryError::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, RetryError::Exhausted { .. })
    }

    pub fn map<F, U>(self, f: F) -> RetryError<U>
    where
        F: FnOnce(E) -> U,
    {
        match self {
            RetryError::Fatal { error, attempts } => RetryError::Fatal {
                error: f(error),
                attempts,
            },
            RetryError::Exhausted { error, attempts } => RetryError::Exhausted {
                error: f(error),
                attempts,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    backoff: BackoffPolicy,
}

impl RetryPolicy {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self { backoff }
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Run `operation` until it succeeds, fails fatally, or the retry budget is
    /// spent. The closure receives the zero-based attempt index.
    pub async fn execute<T, E, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut attempt = 0usize;
        loop {
            debug!(label, attempt = attempt + 1, "attempt");
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        info!(label, attempts = attempt + 1, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    let attempts = attempt + 1;
                    if !error.is_retryable() {
                        warn!(label, attempts, %error, "non-retryable failure; giving up");
                        return Err(RetryError::Fatal { error, attempts });
                    }
                    if attempt >= self.backoff.max_retries {
                        warn!(label, attempts, %error, "retries exhausted");
                        return Err(RetryError::Exhausted { error, attempts });
                    }
                    let delay = self.backoff.delay_for_attempt(attempt);
                    warn!(
                        label,
                        attempts,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "retryable failure; backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum TestError {
        Transient,
        Permanent,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Retryable for TestError {
        fn disposition(&self) -> RetryDisposition {
            match self {
                TestError::Transient => RetryDisposition::Retryable,
                TestError::Permanent => RetryDisposition::NonRetryable,
            }
        }
    }

    fn policy(max_retries: usize) -> RetryPolicy {
        RetryPolicy::new(BackoffPolicy {
            max_retries,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        })
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[tokio::test(start_paused = true)]
    async fn three_retryable_failures_then_success_sleeps_one_two_four() {
        let start = Instant::now();
        let mut seen_at = Vec::new();
        let result = policy(3)
            .execute("test", |attempt| {
                seen_at.push(start.elapsed());
                async move {
                    if attempt < 3 {
                        Err(TestError::Transient)
                    } else {
                        Ok(attempt + 1)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 4);
        let gaps: Vec<u64> = seen_at
            .windows(2)
            .map(|w| (w[1] - w[0]).as_secs())
            .collect();
        assert_eq!(gaps, vec![1, 2, 4]);
        assert_eq!(start.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_carry_last_error_and_attempt_count() {
        let mut calls = 0usize;
        let result: Result<(), _> = policy(2)
            .execute("test", |_| {
                calls += 1;
                async { Err(TestError::Transient) }
            })
            .await;

        let err = result.unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(err.attempts(), 3);
        assert_eq!(*err.error(), TestError::Transient);
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_aborts_without_sleeping() {
        let start = Instant::now();
        let mut calls = 0usize;
        let result: Result<(), _> = policy(3)
            .execute("test", |_| {
                calls += 1;
                async { Err(TestError::Permanent) }
            })
            .await;

        let err = result.unwrap_err();
        assert!(!err.is_exhausted());
        assert_eq!(err.attempts(), 1);
        assert_eq!(calls, 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
