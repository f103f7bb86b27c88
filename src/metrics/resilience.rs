//! # Resilience Metrics
//!
//! Circuit breaker and rate limiter instruments.
//!
//! ```rust
//! use verity_core::metrics::resilience::*;
//! use opentelemetry::KeyValue;
//!
//! circuit_breaker_rejections_total().add(1, &[KeyValue::new("component", "scorer")]);
//! ```

use opentelemetry::metrics::{Counter, Histogram, Meter};
use std::sync::OnceLock;

static RESILIENCE_METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    RESILIENCE_METER.get_or_init(|| opentelemetry::global::meter_provider().meter("verity-resilience"))
}

/// Breaker state changes
///
/// Labels:
/// - component: Breaker name
/// - from / to: States
pub fn circuit_breaker_transitions_total() -> Counter<u64> {
    meter()
        .u64_counter("verity.circuit_breaker.transitions.total")
        .with_description("Circuit breaker state transitions")
        .build()
}

/// Calls refused while a breaker was open
pub fn circuit_breaker_rejections_total() -> Counter<u64> {
    meter()
        .u64_counter("verity.circuit_breaker.rejections.total")
        .with_description("Calls rejected by an open circuit breaker")
        .build()
}

/// Permits acquired
///
/// Labels:
/// - permit: Resolved permit name
pub fn permit_acquisitions_total() -> Counter<u64> {
    meter()
        .u64_counter("verity.rate_limit.acquisitions.total")
        .with_description("Distributed permits acquired")
        .build()
}

/// Acquisitions that gave up after the max wait
pub fn permit_timeouts_total() -> Counter<u64> {
    meter()
        .u64_counter("verity.rate_limit.timeouts.total")
        .with_description("Permit acquisitions that exceeded their max wait")
        .build()
}

/// Time spent waiting for a permit
pub fn permit_wait_duration() -> Histogram<f64> {
    meter()
        .f64_histogram("verity.rate_limit.wait.duration")
        .with_description("Time spent waiting for a distributed permit")
        .with_unit("ms")
        .build()
}

/// Duplicate executions of an in-flight task that reused its permit
pub fn permit_leaks_prevented_total() -> Counter<u64> {
    meter()
        .u64_counter("verity.rate_limit.leaks_prevented.total")
        .with_description("Second permit acquisitions avoided for an in-flight task id")
        .build()
}

/// Release attempts retried after a transient failure
pub fn permit_release_retries_total() -> Counter<u64> {
    meter()
        .u64_counter("verity.rate_limit.release_retries.total")
        .with_description("Permit release attempts retried")
        .build()
}

/// Releases that exhausted all attempts
pub fn permit_release_failures_total() -> Counter<u64> {
    meter()
        .u64_counter("verity.rate_limit.release_failures.total")
        .with_description("Permit releases that failed after all retries")
        .build()
}

/// Critical alerts for consecutive release failures
pub fn permit_release_alerts_total() -> Counter<u64> {
    meter()
        .u64_counter("verity.rate_limit.release_alerts.total")
        .with_description("Critical alerts raised for consecutive release failures")
        .build()
}
