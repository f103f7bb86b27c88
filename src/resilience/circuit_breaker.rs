//! # Circuit Breaker Implementation
//!
//! Fault isolation for a flaky dependency. Three states:
//! Closed (normal operation), Open (failing fast) and Half-Open (one probe).
//!
//! State and counters are mutated under a short `parking_lot` critical
//! section that is never held across an `.await`; the wrapped operation itself
//! runs outside of it, so concurrent callers only serialize on bookkeeping.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::CircuitBreakerConfig;
use crate::metrics::resilience as resilience_metrics;

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed,
    /// Failure mode - all calls fail fast without executing
    Open,
    /// Testing recovery - a single probe call is allowed through
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned by [`CircuitBreaker::check`] when a call may not proceed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Circuit breaker is open for {component}")]
pub struct CircuitOpenError {
    pub component: String,
}

/// Errors that can occur during circuit breaker operation
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, the operation was not invoked
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    /// The operation ran and failed
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

impl<E> CircuitBreakerError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// The operation's own error, if it ran
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::OperationFailed(err) => Some(err),
            Self::CircuitOpen { .. } => None,
        }
    }
}

impl<E> From<CircuitOpenError> for CircuitBreakerError<E> {
    fn from(err: CircuitOpenError) -> Self {
        Self::CircuitOpen {
            component: err.component,
        }
    }
}

/// Point-in-time view of a breaker for health checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub reset_timeout_secs: f64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub total_calls: u64,
    pub rejected_calls: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    /// Monotonic stamp used for the reset timeout
    last_failure: Option<Instant>,
    /// Wall clock stamp reported in status
    last_failure_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            last_failure_at: None,
            probe_in_flight: false,
        }
    }
}

/// Three-state circuit breaker
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
    total_calls: AtomicU64,
    rejected_calls: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and configuration
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            reset_timeout_secs = config.reset_timeout.as_secs_f64(),
            "Circuit breaker initialized"
        );

        Self {
            name,
            config,
            inner: Mutex::new(BreakerState::closed()),
            total_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state without side effects
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Decide whether a call may proceed now.
    ///
    /// OPEN fails fast until the reset timeout has passed since the last
    /// failure; the first check after that moves to HALF_OPEN and admits one
    /// probe. Further checks fail fast until the probe is recorded.
    pub fn check(&self) -> Result<CircuitState, CircuitOpenError> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(CircuitState::Closed),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed() >= self.config.reset_timeout)
                    .unwrap_or(true);
                if elapsed {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.probe_in_flight = true;
                    Ok(CircuitState::HalfOpen)
                } else {
                    drop(inner);
                    Err(self.reject())
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    drop(inner);
                    Err(self.reject())
                } else {
                    inner.probe_in_flight = true;
                    Ok(CircuitState::HalfOpen)
                }
            }
        }
    }

    /// Execute an operation with circuit breaker protection. Every error
    /// counts as a failure.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_filtered(operation, |_| true).await
    }

    /// Execute an operation, counting only errors for which `is_expected`
    /// returns true. Other errors pass through and leave the breaker alone.
    pub async fn call_filtered<F, Fut, T, E, P>(
        &self,
        operation: F,
        is_expected: P,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        self.check()?;
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        let start = std::time::Instant::now();
        let result = operation().await;
        let duration = start.elapsed();

        match result {
            Ok(value) => {
                debug!(
                    component = %self.name,
                    duration_ms = duration.as_millis() as u64,
                    "Operation succeeded"
                );
                self.record_success();
                Ok(value)
            }
            Err(err) if is_expected(&err) => {
                self.record_failure();
                Err(CircuitBreakerError::OperationFailed(err))
            }
            Err(err) => {
                debug!(
                    component = %self.name,
                    "Operation failed with an error the breaker does not track"
                );
                self.release_probe();
                Err(CircuitBreakerError::OperationFailed(err))
            }
        }
    }

    /// Record a success: any state returns to CLOSED with counters cleared
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed);
        }
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.last_failure_at = None;
        inner.probe_in_flight = false;
    }

    /// Record a failure: opens at the threshold, and a failed probe reopens
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.failure_count = inner.failure_count.max(self.config.failure_threshold);
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Force CLOSED with zeroed counters regardless of current state
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            warn!(component = %self.name, from = %inner.state, "Circuit breaker reset");
            self.transition(&mut inner, CircuitState::Closed);
        }
        *inner = BreakerState::closed();
    }

    /// Force OPEN (for emergency situations)
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        warn!(component = %self.name, "Circuit breaker forced open");
        inner.failure_count = inner.failure_count.max(self.config.failure_threshold);
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());
        inner.probe_in_flight = false;
        if inner.state != CircuitState::Open {
            self.transition(&mut inner, CircuitState::Open);
        }
    }

    pub fn status(&self) -> CircuitBreakerStatus {
        let inner = self.inner.lock();
        CircuitBreakerStatus {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.config.failure_threshold,
            reset_timeout_secs: self.config.reset_timeout.as_secs_f64(),
            last_failure_at: inner.last_failure_at,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    fn release_probe(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
        }
    }

    fn reject(&self) -> CircuitOpenError {
        self.rejected_calls.fetch_add(1, Ordering::Relaxed);
        resilience_metrics::circuit_breaker_rejections_total()
            .add(1, &[KeyValue::new("component", self.name.clone())]);
        debug!(component = %self.name, "Call rejected (circuit open)");
        CircuitOpenError {
            component: self.name.clone(),
        }
    }

    fn transition(&self, inner: &mut BreakerState, to: CircuitState) {
        let from = inner.state;
        inner.state = to;

        match to {
            CircuitState::Open => error!(
                component = %self.name,
                from = %from,
                failure_count = inner.failure_count,
                failure_threshold = self.config.failure_threshold,
                reset_timeout_secs = self.config.reset_timeout.as_secs_f64(),
                "Circuit breaker opened (failing fast)"
            ),
            CircuitState::HalfOpen => info!(
                component = %self.name,
                "Circuit breaker half-open (testing recovery)"
            ),
            CircuitState::Closed => info!(
                component = %self.name,
                from = %from,
                "Circuit breaker closed (recovered)"
            ),
        }

        resilience_metrics::circuit_breaker_transitions_total().add(
            1,
            &[
                KeyValue::new("component", self.name.clone()),
                KeyValue::new("from", from.as_str()),
                KeyValue::new("to", to.as_str()),
            ],
        );
    }
}
