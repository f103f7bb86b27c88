//! # Metrics
//!
//! OpenTelemetry instruments for the resilience primitives and the scan
//! orchestration loop. Instruments are created from the global meter provider;
//! with no exporter installed they are no-ops, so the library never requires a
//! collector.
//!
//! Counters that callers need to read back in-process (release retries,
//! release failures, leaks prevented) are additionally kept in
//! [`crate::rate_limit::RateLimitMetrics`].

pub mod orchestration;
pub mod resilience;
