//! Circuit breaker guarding calls into one external system.
//!
//! Each adapter instance owns one breaker. The breaker fails fast while the
//! external system is known to be down and probes it again once the reset
//! timeout has passed.
//!
//! # State machine
//!
//! ```text
//!                     ┌──────────────────────┐
//!                     │        CLOSED        │
//!                     │ ● calls pass through │
//!                     │ ● counts failures    │
//!                     └──────────────────────┘
//!                       │                  ▲
//!   failure_threshold   │                  │ success_threshold
//!   consecutive fails   │                  │ consecutive probes ok
//!                       ▼                  │
//!    ┌──────────────────────┐  reset    ┌──────────────────────┐
//!    │         OPEN         │  timeout  │      HALF-OPEN       │
//!    │ ● calls rejected     │ ────────▶ │ ● calls are probes   │
//!    │ ● operation not run  │ ◀──────── │                      │
//!    └──────────────────────┘ any fail  └──────────────────────┘
//! ```
//!
//! Rejections (`CircuitOpen`) are never counted as failures.

use std::{
    future::Future,
    sync::Arc,
    time::{Duration, Instant},
};

use carelink_core::Clock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{IntegrationError, Result};

/// Breaker thresholds and timing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time since the last failure before a probe is allowed.
    pub reset_timeout: Duration,
    /// Consecutive probe successes that close the circuit.
    pub success_threshold: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, reset_timeout: Duration::from_secs(60), success_threshold: 2 }
    }
}

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Rejecting calls.
    Open,
    /// Probing recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Snapshot of a breaker's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitStats {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures since the last success.
    pub failure_count: u32,
    /// Consecutive successful probes while half-open.
    pub success_count: u32,
    /// When the last failure was recorded.
    pub last_failure_at: Option<Instant>,
}

impl CircuitStats {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
        }
    }
}

/// Failure-isolation guard for a single external target.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    stats: Mutex<CircuitStats>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    pub fn new(name: impl Into<String>, config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { name: name.into(), config, clock, stats: Mutex::new(CircuitStats::new()) }
    }

    /// Breaker name used in logs and `CircuitOpen` errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Runs `operation` under the breaker.
    ///
    /// The lock is released while the operation runs, so a slow call never
    /// blocks state reads.
    ///
    /// # Errors
    ///
    /// Returns `CircuitOpen` without invoking `operation` while the circuit
    /// is open and the reset timeout has not elapsed. Otherwise returns the
    /// operation's own error unchanged.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.admit().await?;

        match operation().await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            },
            Err(IntegrationError::CircuitOpen { name }) => {
                Err(IntegrationError::CircuitOpen { name })
            },
            Err(err) => {
                self.record_failure().await;
                Err(err)
            },
        }
    }

    /// Current state, applying the open to half-open timeout lazily.
    pub async fn state(&self) -> CircuitState {
        let stats = self.stats.lock().await;
        if stats.state == CircuitState::Open && self.reset_elapsed(&stats) {
            CircuitState::HalfOpen
        } else {
            stats.state
        }
    }

    /// Snapshot of counters.
    pub async fn stats(&self) -> CircuitStats {
        *self.stats.lock().await
    }

    /// Forces the circuit closed and zeroes all counters.
    pub async fn reset(&self) {
        *self.stats.lock().await = CircuitStats::new();
        info!(breaker = %self.name, "circuit breaker reset");
    }

    async fn admit(&self) -> Result<()> {
        let mut stats = self.stats.lock().await;
        if stats.state != CircuitState::Open {
            return Ok(());
        }
        if self.reset_elapsed(&stats) {
            stats.state = CircuitState::HalfOpen;
            stats.success_count = 0;
            info!(breaker = %self.name, "circuit breaker half-open, probing");
            return Ok(());
        }
        warn!(breaker = %self.name, "circuit breaker open, rejecting call");
        Err(IntegrationError::circuit_open(&self.name))
    }

    fn reset_elapsed(&self, stats: &CircuitStats) -> bool {
        match stats.last_failure_at {
            Some(at) => self.clock.now().saturating_duration_since(at) >= self.config.reset_timeout,
            None => true,
        }
    }

    async fn record_success(&self) {
        let mut stats = self.stats.lock().await;
        match stats.state {
            CircuitState::Closed => stats.failure_count = 0,
            CircuitState::HalfOpen => {
                stats.success_count += 1;
                if stats.success_count >= self.config.success_threshold {
                    *stats = CircuitStats::new();
                    info!(breaker = %self.name, "circuit breaker closed, target recovered");
                }
            },
            CircuitState::Open => {
                warn!(breaker = %self.name, "recorded success while circuit open");
            },
        }
    }

    async fn record_failure(&self) {
        let mut stats = self.stats.lock().await;
        stats.failure_count += 1;
        stats.last_failure_at = Some(self.clock.now());

        match stats.state {
            CircuitState::Closed if stats.failure_count >= self.config.failure_threshold => {
                stats.state = CircuitState::Open;
                error!(
                    breaker = %self.name,
                    failures = stats.failure_count,
                    "circuit breaker opened"
                );
            },
            CircuitState::HalfOpen => {
                stats.state = CircuitState::Open;
                stats.success_count = 0;
                warn!(
                    breaker = %self.name,
                    failures = stats.failure_count,
                    "probe failed, circuit breaker reopened"
                );
            },
            CircuitState::Closed | CircuitState::Open => {},
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use carelink_core::TestClock;

    use super::*;

    fn breaker(clock: &TestClock) -> CircuitBreaker {
        let config = CircuitConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(60),
            success_threshold: 2,
        };
        CircuitBreaker::new("test", config, Arc::new(clock.clone()))
    }

    async fn fail(breaker: &CircuitBreaker) -> IntegrationError {
        breaker
            .execute(|| async { Err::<(), _>(IntegrationError::network("down")) })
            .await
            .unwrap_err()
    }

    async fn succeed(breaker: &CircuitBreaker) {
        breaker.execute(|| async { Ok(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn starts_closed() {
        let breaker = breaker(&TestClock::new());
        assert_eq!(breaker.state().await, CircuitState::Closed);
        succeed(&breaker).await;
    }

    #[tokio::test]
    async fn opens_after_threshold_and_skips_operation() {
        let clock = TestClock::new();
        let breaker = breaker(&clock);
        for _ in 0..3 {
            fail(&breaker).await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);

        let calls = AtomicU32::new(0);
        let err = breaker
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, IntegrationError::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(breaker.stats().await.failure_count, 3);
    }

    #[tokio::test]
    async fn half_open_closes_after_two_successes() {
        let clock = TestClock::new();
        let breaker = breaker(&clock);
        for _ in 0..3 {
            fail(&breaker).await;
        }
        clock.advance(Duration::from_secs(60));
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        succeed(&breaker).await;
        assert_eq!(breaker.stats().await.state, CircuitState::HalfOpen);
        succeed(&breaker).await;

        let stats = breaker.stats().await;
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
    }

    #[tokio::test]
    async fn probe_failure_reopens() {
        let clock = TestClock::new();
        let breaker = breaker(&clock);
        for _ in 0..3 {
            fail(&breaker).await;
        }
        clock.advance(Duration::from_secs(61));
        succeed(&breaker).await;
        fail(&breaker).await;

        let stats = breaker.stats().await;
        assert_eq!(stats.state, CircuitState::Open);
        assert_eq!(stats.success_count, 0);
        assert!(matches!(fail(&breaker).await, IntegrationError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn success_resets_failure_count_while_closed() {
        let breaker = breaker(&TestClock::new());
        fail(&breaker).await;
        fail(&breaker).await;
        succeed(&breaker).await;
        fail(&breaker).await;
        fail(&breaker).await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn nested_circuit_open_is_not_counted() {
        let breaker = breaker(&TestClock::new());
        for _ in 0..5 {
            let _ = breaker
                .execute(|| async { Err::<(), _>(IntegrationError::circuit_open("inner")) })
                .await;
        }
        assert_eq!(breaker.stats().await.failure_count, 0);
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn reset_forces_closed() {
        let breaker = breaker(&TestClock::new());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        breaker.reset().await;
        assert_eq!(breaker.stats().await, CircuitStats::new());
        succeed(&breaker).await;
    }
}
