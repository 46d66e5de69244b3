use std::future::Future;
use std::time;

use tracing::warn;

use crate::config::RetryPolicyConfig;

#[derive(Copy, Clone, Debug)]
/// Exponential backoff used when an operation fails with a transient error.
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    initial_interval: time::Duration,
    /// The maximum possible backoff between retries.
    maximum_interval: Option<time::Duration>,
    /// Total number of attempts, including the first one.
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(
        backoff_coefficient: u32,
        initial_interval: time::Duration,
        maximum_interval: Option<time::Duration>,
        max_attempts: u32,
    ) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Time to wait after the given (zero-based) failed attempt.
    pub fn retry_interval(&self, attempt: u32) -> time::Duration {
        let candidate_interval = self
            .initial_interval
            .saturating_mul(self.backoff_coefficient.saturating_pow(attempt));

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }

    /// Run `operation` until it succeeds, fails with an error `is_retryable` rejects, or
    /// runs out of attempts. The last error is returned in the two failure cases.
    pub async fn retry<T, E, F, Fut>(
        &self,
        description: &str,
        is_retryable: impl Fn(&E) -> bool,
        mut operation: F,
    ) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if attempt + 1 < self.max_attempts && is_retryable(&error) => {
                    let interval = self.retry_interval(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        retry_in_ms = interval.as_millis() as u64,
                        "{} failed: {}",
                        description,
                        error
                    );
                    tokio::time::sleep(interval).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: None,
            max_attempts: 3,
        }
    }
}

impl From<&RetryPolicyConfig> for RetryPolicy {
    fn from(config: &RetryPolicyConfig) -> Self {
        RetryPolicy::new(
            config.backoff_coefficient,
            config.initial_interval.0,
            Some(config.maximum_interval.0),
            config.max_attempts,
        )
    }
}
