//! Job control surface and liveness checks.

pub mod batch_job_service;
pub mod stuck_job_detector;

pub use batch_job_service::{BatchJobService, FinalCounts};
pub use stuck_job_detector::{StuckJob, StuckJobDetector};
