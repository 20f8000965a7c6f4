//! Bounded retry with exponential backoff
//!
//! Used around sink writes. Only errors whose
//! [`is_retriable`](crate::error::StreamError::is_retriable) is true are
//! retried; anything else returns immediately.

use std::future::Future;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::error::{Result, StreamError};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not including the initial attempt)
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each retry)
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Fail on the first error
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Same delay before every retry
    pub fn fixed_delay(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Total attempts, including the first
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before attempt `attempt` (1 is the first retry; 0 is no delay)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        // cap the exponent so powi stays finite
        let capped_attempt = attempt.min(30);
        let base_delay = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(capped_attempt as i32 - 1);
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_delay.max(0.0) as u64)
    }
}

/// Result of a retry operation
#[derive(Debug)]
pub struct RetryResult<T> {
    /// The successful result, if any
    pub result: Option<T>,
    /// Number of attempts made
    pub attempts: u32,
    /// Total time spent, including delays
    pub total_duration: Duration,
    /// Last error encountered (if failed)
    pub last_error: Option<StreamError>,
}

impl<T> RetryResult<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_some()
    }

    /// Get the result or the last error
    pub fn into_result(self) -> Result<T> {
        match self.result {
            Some(value) => Ok(value),
            None => Err(self
                .last_error
                .unwrap_or_else(|| StreamError::state("retry finished with no result and no error"))),
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retriable error, or
/// the policy's retries are used up.
///
/// Every failed attempt is logged with `label`.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut operation: F) -> RetryResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let mut attempts = 0;

    loop {
        attempts += 1;

        match operation().await {
            Ok(value) => {
                return RetryResult {
                    result: Some(value),
                    attempts,
                    total_duration: start.elapsed(),
                    last_error: None,
                };
            }
            Err(error) => {
                let should_retry = error.is_retriable() && attempts <= policy.max_retries;
                warn!(
                    operation = label,
                    attempt = attempts,
                    max_attempts = policy.max_attempts(),
                    retrying = should_retry,
                    error = %error,
                    "Write attempt failed"
                );

                if !should_retry {
                    return RetryResult {
                        result: None,
                        attempts,
                        total_duration: start.elapsed(),
                        last_error: Some(error),
                    };
                }
                tokio::time::sleep(policy.delay_for_attempt(attempts)).await;
            }
        }
    }
}
