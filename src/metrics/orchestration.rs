//! # Orchestration Metrics
//!
//! Job lifecycle and scan completion instruments.

use opentelemetry::metrics::{Counter, Histogram, Meter};
use std::sync::OnceLock;

static ORCHESTRATION_METER: OnceLock<Meter> = OnceLock::new();

fn meter() -> &'static Meter {
    ORCHESTRATION_METER
        .get_or_init(|| opentelemetry::global::meter_provider().meter("verity-orchestration"))
}

/// Job status transitions
///
/// Labels:
/// - job_type
/// - to: Target status
pub fn job_transitions_total() -> Counter<u64> {
    meter()
        .u64_counter("verity.jobs.transitions.total")
        .with_description("Job status transitions persisted")
        .build()
}

/// Scans finalized, labelled by the trigger that won the race
pub fn scan_finalizations_total() -> Counter<u64> {
    meter()
        .u64_counter("verity.scans.finalizations.total")
        .with_description("Scans finalized")
        .build()
}

/// Completion signals that arrived after the scan was already handled
pub fn duplicate_completion_signals_total() -> Counter<u64> {
    meter()
        .u64_counter("verity.scans.duplicate_signals.total")
        .with_description("Redelivered or late completion signals ignored")
        .build()
}

/// Batch worker wall time
pub fn batch_duration() -> Histogram<f64> {
    meter()
        .f64_histogram("verity.scans.batch.duration")
        .with_description("Batch worker execution time")
        .with_unit("ms")
        .build()
}

/// Jobs reported by the stuck detector
pub fn stuck_jobs_detected_total() -> Counter<u64> {
    meter()
        .u64_counter("verity.jobs.stuck.total")
        .with_description("Non-terminal jobs with no progress past the stall threshold")
        .build()
}
