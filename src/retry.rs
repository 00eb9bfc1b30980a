//! Local retry for transient probe and dispatch faults.
//!
//! Probes and dispatches that fail at the transport level are retried a
//! small, configured number of times before the fault is charged to the
//! agent. Probes retry at a fixed delay; dispatches back off
//! exponentially. Task-level failures reported by an agent are never retried here;
//! that budget belongs to the router.
//!
//! ```rust
//! use std::time::Duration;
//! use tokio_fleet_coordinator::retry::RetryPolicy;
//!
//! // One initial attempt plus two retries, 50ms apart.
//! let policy = RetryPolicy::fixed(2, Duration::from_millis(50));
//! assert_eq!(policy.max_attempts, 3);
//! ```

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Always at least 1.
    pub max_attempts: usize,
    /// Delay between attempts.
    pub strategy: RetryStrategy,
}

/// Retry backoff strategy.
#[derive(Clone, Debug, PartialEq)]
pub enum RetryStrategy {
    /// Fixed delay between retries.
    Fixed(Duration),
    /// Delay multiplied on each retry, capped at `max_delay`.
    Exponential {
        /// Delay before the first retry.
        initial_delay: Duration,
        /// Upper bound for any single delay.
        max_delay: Duration,
        /// Growth factor per retry.
        multiplier: f64,
    },
}

impl RetryPolicy {
    /// `retries` retries after the first attempt, `delay` apart.
    pub fn fixed(retries: u32, delay: Duration) -> Self {
        Self {
            max_attempts: retries as usize + 1,
            strategy: RetryStrategy::Fixed(delay),
        }
    }

    /// `retries` retries after the first attempt, doubling from `initial_delay`.
    pub fn exponential(retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: retries as usize + 1,
            strategy: RetryStrategy::Exponential {
                initial_delay,
                max_delay: Duration::from_secs(10),
                multiplier: 2.0,
            },
        }
    }

    /// Execute `f`, retrying every error.
    ///
    /// # Errors
    ///
    /// Returns the last error once all attempts are exhausted.
    pub async fn retry<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.retry_if(f, |_| true).await
    }

    /// Execute `f`, retrying only errors for which `should_retry` is true.
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable error, or the last error once all
    /// attempts are exhausted.
    pub async fn retry_if<F, Fut, T, E, P>(&self, mut f: F, mut should_retry: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnMut(&E) -> bool,
        E: std::fmt::Display,
    {
        let max = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            match f().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "retry: succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(e) => {
                    if !should_retry(&e) {
                        debug!(error = %e, "retry: error is not retryable");
                        return Err(e);
                    }
                    if attempt >= max {
                        warn!(attempts = attempt, error = %e, "retry: all attempts exhausted");
                        return Err(e);
                    }
                    let delay = self.delay_for(attempt);
                    debug!(attempt, max, delay_ms = delay.as_millis() as u64, error = %e, "retry: backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: usize) -> Duration {
        match &self.strategy {
            RetryStrategy::Fixed(delay) => *delay,
            RetryStrategy::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                let exp = attempt.saturating_sub(1).min(32) as i32;
                let ms = initial_delay.as_millis() as f64 * multiplier.powi(exp);
                Duration::from_millis(ms as u64).min(*max_delay)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_eventually() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let policy = RetryPolicy::fixed(4, Duration::from_millis(10));

        let result = policy
            .retry(|| {
                let attempts = attempts.clone();
                async move {
                    let count = attempts.fetch_add(1, Ordering::SeqCst);
                    if count < 2 {
                        Err("failing")
                    } else {
                        Ok("success")
                    }
                }
            })
            .await;

        assert_eq!(result, Ok("success"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_attempts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let policy = RetryPolicy::fixed(2, Duration::from_millis(10));

        let result: Result<(), &str> = policy
            .retry(|| {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err("always fails")
                }
            })
            .await;

        assert_eq!(result, Err("always fails"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_if_stops_on_non_retryable() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));

        let result: Result<(), String> = policy
            .retry_if(
                || {
                    let attempts = attempts.clone();
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err("fatal".to_string())
                    }
                },
                |e| e != "fatal",
            )
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_retries_makes_single_attempt() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let result: Result<(), &str> = RetryPolicy::fixed(0, Duration::ZERO)
            .retry(|| {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err("nope")
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exponential_delay_doubles_and_caps() {
        let policy = RetryPolicy::exponential(20, Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(20), Duration::from_secs(10));
    }
}
