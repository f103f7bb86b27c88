//! # Models
//!
//! Persisted entities owned by the orchestration layer.

pub mod job;

pub use job::{ErrorSummary, Job, JobFilter, JobMetadata};
