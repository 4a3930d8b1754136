//! Backoff delay sequences and a retry driver for fallible async operations.
//!
//! A policy allows `max_retries + 1` attempts. Between attempts the driver
//! sleeps on the injected clock for the current delay, then advances it:
//!
//! - exponential: `min(delay * 2, max_delay)`
//! - linear: `min(delay + initial_delay, max_delay)`
//! - fixed: `initial_delay`
//!
//! The first delay is `initial_delay`, capped at `max_delay`, so the k-th
//! exponential delay is always `min(initial * 2^k, max)`.

use std::{fmt::Display, future::Future, time::Duration};

use carelink_core::{BackoffStrategy, Clock, RetryConfig};
use tracing::{error, warn};

/// Retry settings with typed durations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// How the delay evolves.
    pub strategy: BackoffStrategy,
    /// First delay.
    pub initial_delay: Duration,
    /// Upper bound for every delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(RetryConfig::default())
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            strategy: config.backoff_strategy,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Total attempts the policy allows.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay slept before the first retry.
    pub fn first_delay(&self) -> Duration {
        self.initial_delay.min(self.max_delay)
    }

    /// Delay that follows `current`.
    pub fn next_delay(&self, current: Duration) -> Duration {
        match self.strategy {
            BackoffStrategy::Exponential => current.saturating_mul(2).min(self.max_delay),
            BackoffStrategy::Linear => current.saturating_add(self.initial_delay).min(self.max_delay),
            BackoffStrategy::Fixed => self.first_delay(),
        }
    }

    /// The full sequence of sleeps, one per retry.
    pub fn delays(&self) -> Vec<Duration> {
        let mut delays = Vec::with_capacity(self.max_retries as usize);
        let mut delay = self.first_delay();
        for _ in 0..self.max_retries {
            delays.push(delay);
            delay = self.next_delay(delay);
        }
        delays
    }

    /// Runs `operation` until it succeeds or attempts run out.
    ///
    /// The closure receives the zero-based attempt index.
    ///
    /// # Errors
    ///
    /// Returns the error of the final attempt unchanged.
    pub async fn retry<T, E, F, Fut>(&self, clock: &dyn Clock, operation: F) -> Result<T, E>
    where
        E: Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.retry_with_observer(clock, operation, |_, _, _| {}).await
    }

    /// Like [`RetryPolicy::retry`], calling `observer(attempt, &error,
    /// next_delay)` before each sleep.
    ///
    /// # Errors
    ///
    /// Returns the error of the final attempt unchanged.
    pub async fn retry_with_observer<T, E, F, Fut, O>(
        &self,
        clock: &dyn Clock,
        operation: F,
        observer: O,
    ) -> Result<T, E>
    where
        E: Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        O: FnMut(u32, &E, Duration),
    {
        self.drive(clock, operation, |_| true, observer).await
    }

    /// Like [`RetryPolicy::retry`], giving up at once on errors for which
    /// `should_retry` returns false.
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable error, or the error of the final
    /// attempt.
    pub async fn retry_if<T, E, F, Fut, P>(
        &self,
        clock: &dyn Clock,
        operation: F,
        should_retry: P,
    ) -> Result<T, E>
    where
        E: Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        self.drive(clock, operation, should_retry, |_, _, _| {}).await
    }

    async fn drive<T, E, F, Fut, P, O>(
        &self,
        clock: &dyn Clock,
        mut operation: F,
        should_retry: P,
        mut observer: O,
    ) -> Result<T, E>
    where
        E: Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        O: FnMut(u32, &E, Duration),
    {
        let mut delay = self.first_delay();
        let mut attempt = 0;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if !should_retry(&err) => return Err(err),
                Err(err) if attempt >= self.max_retries => {
                    error!(attempts = attempt + 1, error = %err, "retries exhausted");
                    return Err(err);
                },
                Err(err) => {
                    warn!(
                        attempt = attempt + 1,
                        next_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "attempt failed, retrying"
                    );
                    observer(attempt, &err, delay);
                    clock.sleep(delay).await;
                    delay = self.next_delay(delay);
                    attempt += 1;
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use carelink_core::TestClock;

    use super::*;

    fn policy(strategy: BackoffStrategy, max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            strategy,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
        }
    }

    fn ms(values: &[u64]) -> Vec<Duration> {
        values.iter().copied().map(Duration::from_millis).collect()
    }

    #[test]
    fn delay_sequences_per_strategy() {
        assert_eq!(
            policy(BackoffStrategy::Exponential, 5).delays(),
            ms(&[1000, 2000, 4000, 5000, 5000])
        );
        assert_eq!(
            policy(BackoffStrategy::Linear, 6).delays(),
            ms(&[1000, 2000, 3000, 4000, 5000, 5000])
        );
        assert_eq!(policy(BackoffStrategy::Fixed, 3).delays(), ms(&[1000, 1000, 1000]));
    }

    #[test]
    fn default_policy_matches_default_retry_config() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 4);
        assert_eq!(policy.delays(), ms(&[1000, 2000, 4000]));
    }

    #[tokio::test]
    async fn zero_retries_means_one_attempt_without_sleep() {
        let clock = TestClock::new();
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = policy(BackoffStrategy::Exponential, 0)
            .retry(&clock, |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("nope".to_string())
            })
            .await;

        assert_eq!(result.unwrap_err(), "nope");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let clock = TestClock::new();
        let mut observed = Vec::new();
        let result = policy(BackoffStrategy::Exponential, 3)
            .retry_with_observer(
                &clock,
                |attempt| async move {
                    if attempt < 2 {
                        Err(format!("fail {attempt}"))
                    } else {
                        Ok(attempt)
                    }
                },
                |attempt, err: &String, delay| observed.push((attempt, err.clone(), delay)),
            )
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(
            observed,
            vec![
                (0, "fail 0".to_string(), Duration::from_millis(1000)),
                (1, "fail 1".to_string(), Duration::from_millis(2000)),
            ]
        );
        assert_eq!(clock.elapsed(), Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let clock = TestClock::new();
        let result: Result<(), String> = policy(BackoffStrategy::Fixed, 2)
            .retry(&clock, |attempt| async move { Err(format!("attempt {attempt}")) })
            .await;

        assert_eq!(result.unwrap_err(), "attempt 2");
        assert_eq!(clock.elapsed(), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let clock = TestClock::new();
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = policy(BackoffStrategy::Exponential, 3)
            .retry_if(
                &clock,
                |_| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("fatal".to_string())
                },
                |err| err != "fatal",
            )
            .await;

        assert_eq!(result.unwrap_err(), "fatal");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(clock.elapsed(), Duration::ZERO);
    }
}
