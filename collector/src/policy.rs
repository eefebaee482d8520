use crate::error::AttemptError;
use cluster_diag_config::Config;
use std::{
    future::Future,
    time::Duration,
};

/// Retry and timeout composition for one call, independent of the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    /// Pause between two attempts.
    pub pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            pause: Duration::from_millis(500),
        }
    }
}

#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, AttemptError>,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, pause: Duration) -> Self {
        Self { max_retries, pause }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.retries, config.retry_pause())
    }

    /// Only transport failures of idempotent calls are retried, at most `max_retries` times.
    pub fn should_retry(&self, error: &AttemptError, idempotent: bool, attempts: u32) -> bool {
        idempotent && error.is_transport() && attempts <= self.max_retries
    }

    /// Runs `attempt` until it succeeds, fails for good or the retries are used up. Each attempt
    /// gets the full `timeout`, so the total latency is bounded by `timeout * (max_retries + 1)`
    /// plus the pauses.
    pub async fn run<T, F, Fut>(&self, idempotent: bool, timeout: Duration, mut attempt: F) -> Attempted<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = match tokio::time::timeout(timeout, attempt()).await {
                Ok(result) => result,
                Err(_) => Err(AttemptError::Timeout(timeout)),
            };
            match result {
                Err(error) if self.should_retry(&error, idempotent, attempts) => {
                    debug!(attempt = attempts, %error, "retrying call");
                    if !self.pause.is_zero() {
                        tokio::time::sleep(self.pause).await;
                    }
                }
                result => return Attempted { result, attempts },
            }
        }
    }
}
