//! Circuit breaker guarding calls to the ledger endpoint
//!
//! Closed -> Open after `failure_threshold` consecutive failures. Open rejects
//! every call until `reset_timeout` has elapsed, then moves to HalfOpen and
//! admits up to `half_open_max_calls` concurrent trial calls.
//! `success_threshold` consecutive trial successes close the breaker; any
//! trial failure reopens it.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

fn default_failure_threshold() -> u32 { 5 }
fn default_success_threshold() -> u32 { 2 }
fn default_reset_timeout_ms() -> u64 { 30_000 }
fn default_half_open_max_calls() -> u32 { 1 }

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

/// Error returned by `CircuitBreaker::execute`
#[derive(Debug, Error, PartialEq)]
pub enum BreakerError<E> {
    #[error("Circuit breaker open for {endpoint}")]
    Open { endpoint: String },

    #[error(transparent)]
    Inner(E),
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub endpoint: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    #[serde(skip)]
    pub last_failure: Option<Instant>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
    last_failure: Option<Instant>,
}

/// Per-endpoint circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    endpoint: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(endpoint: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            endpoint: endpoint.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                half_open_in_flight: 0,
                opened_at: None,
                last_failure: None,
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Current state, applying the open -> half-open timeout
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        BreakerSnapshot {
            endpoint: self.endpoint.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure: inner.last_failure,
        }
    }

    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let reset = Duration::from_millis(self.config.reset_timeout_ms);
        if inner.opened_at.is_some_and(|at| at.elapsed() >= reset) {
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
            inner.half_open_in_flight = 0;
            debug!(endpoint = %self.endpoint, "Circuit breaker transitioned to HALF_OPEN");
        }
    }

    /// Admission check. Reserves a trial slot when half-open.
    fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_calls.max(1) {
                    inner.half_open_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.opened_at = None;
                    debug!(endpoint = %self.endpoint, "Circuit breaker transitioned to CLOSED");
                }
            }
            // Late result of a call admitted before the breaker opened
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.last_failure = Some(now);
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.open(&mut inner, now);
                }
            }
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                self.open(&mut inner, now);
            }
            CircuitState::Open => {}
        }
    }

    fn open(&self, inner: &mut BreakerInner, now: Instant) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.success_count = 0;
        inner.half_open_in_flight = 0;
        crate::metrics::metrics().breaker_opened.inc();
        warn!(
            endpoint = %self.endpoint,
            failures = inner.failure_count,
            "Circuit breaker transitioned to OPEN"
        );
    }

    /// Run `operation` through the breaker
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.try_acquire() {
            crate::metrics::metrics().breaker_rejections.inc();
            return Err(BreakerError::Open {
                endpoint: self.endpoint.clone(),
            });
        }

        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(BreakerError::Inner(err))
            }
        }
    }
}

/// One breaker per endpoint, created on first use
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, endpoint: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(endpoint, self.config.clone())))
            .clone()
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.iter().map(|b| b.value().snapshot()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failures: u32, successes: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "primary",
            BreakerConfig {
                failure_threshold: failures,
                success_threshold: successes,
                reset_timeout_ms: 1_000,
                half_open_max_calls: 1,
            },
        )
    }

    async fn fail(b: &CircuitBreaker) -> Result<(), BreakerError<&'static str>> {
        b.execute(|| async { Err::<(), _>("boom") }).await
    }

    async fn succeed(b: &CircuitBreaker) -> Result<u32, BreakerError<&'static str>> {
        b.execute(|| async { Ok::<_, &'static str>(1) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_exact_threshold() {
        let b = breaker(3, 2);
        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Closed);
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_rejects_without_calling() {
        let b = breaker(1, 1);
        fail(&b).await.unwrap_err();

        let mut called = false;
        let result = b
            .execute(|| {
                called = true;
                async { Ok::<_, &'static str>(()) }
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open { .. })));
        assert!(!called);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_then_closed_after_successes() {
        let b = breaker(2, 2);
        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(1_001)).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);

        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_failure_reopens() {
        let b = breaker(1, 3);
        fail(&b).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert_eq!(b.state(), CircuitState::HalfOpen);

        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);
        assert!(matches!(succeed(&b).await, Err(BreakerError::Open { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_failures() {
        let b = breaker(3, 1);
        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        succeed(&b).await.unwrap();
        fail(&b).await.unwrap_err();
        fail(&b).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_limits_trial_calls() {
        let b = breaker(1, 1);
        fail(&b).await.unwrap_err();
        tokio::time::advance(Duration::from_millis(1_000)).await;

        assert!(b.try_acquire());
        assert!(!b.try_acquire());
        b.record_success();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_registry_reuses_breakers() {
        let registry = CircuitBreakerRegistry::new(BreakerConfig::default());
        let a = registry.get("primary");
        let b = registry.get("primary");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.snapshots().len(), 1);
    }
}
