//! In-process rate limiter counters.
//!
//! Mirrors the OpenTelemetry instruments in [`crate::metrics::resilience`]
//! with lock-free atomics so health checks and tests can read them back.
//! The consecutive release failure counter is per process: any successful
//! release, on any permit, resets it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::constants::DEFAULT_RELEASE_ALERT_THRESHOLD;
use crate::metrics::resilience as resilience_metrics;

static GLOBAL_METRICS: OnceLock<Arc<RateLimitMetrics>> = OnceLock::new();

#[derive(Debug)]
pub struct RateLimitMetrics {
    alert_threshold: u64,
    leaks_prevented: AtomicU64,
    release_retries: AtomicU64,
    release_failures: AtomicU64,
    consecutive_release_failures: AtomicU64,
    alerts_raised: AtomicU64,
}

/// Copy of the counters at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RateLimitMetricsSnapshot {
    pub leaks_prevented: u64,
    pub release_retries: u64,
    pub release_failures: u64,
    pub consecutive_release_failures: u64,
    pub alerts_raised: u64,
}

impl RateLimitMetrics {
    pub fn new(alert_threshold: u64) -> Self {
        Self {
            alert_threshold: alert_threshold.max(1),
            leaks_prevented: AtomicU64::new(0),
            release_retries: AtomicU64::new(0),
            release_failures: AtomicU64::new(0),
            consecutive_release_failures: AtomicU64::new(0),
            alerts_raised: AtomicU64::new(0),
        }
    }

    /// Process-wide counters shared by every middleware that does not get
    /// its own instance injected
    pub fn global() -> Arc<RateLimitMetrics> {
        Self::global_with(DEFAULT_RELEASE_ALERT_THRESHOLD)
    }

    /// Process-wide counters, created with `alert_threshold` on first use.
    /// Later callers share the existing instance and its threshold.
    pub fn global_with(alert_threshold: u64) -> Arc<RateLimitMetrics> {
        let metrics = GLOBAL_METRICS.get_or_init(|| Arc::new(RateLimitMetrics::new(alert_threshold)));
        if metrics.alert_threshold != alert_threshold.max(1) {
            debug!(
                configured = alert_threshold,
                active = metrics.alert_threshold,
                "Release alert threshold already set for this process"
            );
        }
        Arc::clone(metrics)
    }

    pub fn alert_threshold(&self) -> u64 {
        self.alert_threshold
    }

    pub fn record_leak_prevented(&self, permit: &str, task_id: &str) {
        self.leaks_prevented.fetch_add(1, Ordering::Relaxed);
        resilience_metrics::permit_leaks_prevented_total()
            .add(1, &[KeyValue::new("permit", permit.to_string())]);
        warn!(
            permit = permit,
            task_id = task_id,
            "Duplicate execution for in-flight task; reusing its permit (leak prevented)"
        );
    }

    pub fn record_release_retry(&self, permit: &str, attempt: u32, error: &str) {
        self.release_retries.fetch_add(1, Ordering::Relaxed);
        resilience_metrics::permit_release_retries_total()
            .add(1, &[KeyValue::new("permit", permit.to_string())]);
        warn!(
            permit = permit,
            attempt = attempt,
            error = error,
            "Permit release failed; retrying"
        );
    }

    pub fn record_release_success(&self) {
        self.consecutive_release_failures.store(0, Ordering::Relaxed);
    }

    /// Record a release that exhausted its attempts. Returns whether a
    /// critical alert was raised.
    pub fn record_release_failure(&self, permit: &str, attempts: u32, error: &str) -> bool {
        self.release_failures.fetch_add(1, Ordering::Relaxed);
        let consecutive = self
            .consecutive_release_failures
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        resilience_metrics::permit_release_failures_total()
            .add(1, &[KeyValue::new("permit", permit.to_string())]);

        error!(
            permit = permit,
            attempts = attempts,
            consecutive_failures = consecutive,
            error = error,
            "Permit release failed after all retries; the permit expiry will reclaim it"
        );

        if consecutive < self.alert_threshold {
            return false;
        }

        self.alerts_raised.fetch_add(1, Ordering::Relaxed);
        resilience_metrics::permit_release_alerts_total().add(1, &[]);
        error!(
            alert = true,
            severity = "critical",
            permit = permit,
            consecutive_failures = consecutive,
            alert_threshold = self.alert_threshold,
            "Consecutive permit release failures crossed the alert threshold"
        );
        true
    }

    pub fn snapshot(&self) -> RateLimitMetricsSnapshot {
        RateLimitMetricsSnapshot {
            leaks_prevented: self.leaks_prevented.load(Ordering::Relaxed),
            release_retries: self.release_retries.load(Ordering::Relaxed),
            release_failures: self.release_failures.load(Ordering::Relaxed),
            consecutive_release_failures: self.consecutive_release_failures.load(Ordering::Relaxed),
            alerts_raised: self.alerts_raised.load(Ordering::Relaxed),
        }
    }
}

impl Default for RateLimitMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_RELEASE_ALERT_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_fires_at_threshold_and_resets_on_success() {
        let metrics = RateLimitMetrics::new(3);

        assert!(!metrics.record_release_failure("scope:a", 3, "down"));
        assert!(!metrics.record_release_failure("scope:b", 3, "down"));
        assert!(metrics.record_release_failure("scope:a", 3, "down"));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.release_failures, 3);
        assert_eq!(snapshot.consecutive_release_failures, 3);
        assert_eq!(snapshot.alerts_raised, 1);

        metrics.record_release_success();
        assert_eq!(metrics.snapshot().consecutive_release_failures, 0);
        assert!(!metrics.record_release_failure("scope:a", 3, "down"));
        assert_eq!(metrics.snapshot().release_failures, 4);
    }

    #[test]
    fn test_counters() {
        let metrics = RateLimitMetrics::default();
        metrics.record_leak_prevented("scope:a", "task-1");
        metrics.record_release_retry("scope:a", 1, "timeout");
        metrics.record_release_retry("scope:a", 2, "timeout");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.leaks_prevented, 1);
        assert_eq!(snapshot.release_retries, 2);
        assert_eq!(snapshot.release_failures, 0);
    }

    #[test]
    fn test_global_is_shared() {
        assert!(Arc::ptr_eq(&RateLimitMetrics::global(), &RateLimitMetrics::global()));
    }
}
