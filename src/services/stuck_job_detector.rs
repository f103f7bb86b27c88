//! # Stuck Job Detector
//!
//! Liveness check for scans whose completion never arrives (a worker crashed
//! before signaling). Reports only; resolving a stuck job is an operator call.

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use super::batch_job_service::BatchJobService;
use crate::config::StuckDetectionConfig;
use crate::error::Result;
use crate::metrics::orchestration as orchestration_metrics;
use crate::models::JobFilter;
use crate::state_machine::JobStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StuckJob {
    pub job_id: Uuid,
    pub job_type: String,
    pub last_progress_at: DateTime<Utc>,
    pub stalled_seconds: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub total_tasks: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct StuckJobDetector {
    jobs: BatchJobService,
    stall_threshold: chrono::Duration,
}

impl StuckJobDetector {
    pub fn new(jobs: BatchJobService, config: &StuckDetectionConfig) -> Self {
        Self {
            jobs,
            stall_threshold: chrono::Duration::seconds(
                i64::try_from(config.stall_threshold_seconds).unwrap_or(i64::MAX),
            ),
        }
    }

    /// IN_PROGRESS jobs with no progress for longer than the stall threshold
    pub async fn find_stuck(&self, now: DateTime<Utc>) -> Result<Vec<StuckJob>> {
        let running = self
            .jobs
            .list_jobs(&JobFilter::default().with_status(JobStatus::InProgress))
            .await?;

        let stuck: Vec<StuckJob> = running
            .into_iter()
            .filter_map(|job| {
                let stalled = now.signed_duration_since(job.updated_at);
                (stalled > self.stall_threshold).then(|| StuckJob {
                    job_id: job.id,
                    job_type: job.job_type,
                    last_progress_at: job.updated_at,
                    stalled_seconds: stalled.num_seconds().max(0) as u64,
                    completed_tasks: job.completed_tasks,
                    failed_tasks: job.failed_tasks,
                    total_tasks: job.total_tasks,
                })
            })
            .collect();

        for job in &stuck {
            orchestration_metrics::stuck_jobs_detected_total()
                .add(1, &[KeyValue::new("job_type", job.job_type.clone())]);
            warn!(
                job_id = %job.job_id,
                job_type = %job.job_type,
                stalled_seconds = job.stalled_seconds,
                completed_tasks = job.completed_tasks,
                total_tasks = ?job.total_tasks,
                "Job shows no progress past the stall threshold"
            );
        }
        debug!(stuck = stuck.len(), "Stuck job sweep finished");

        Ok(stuck)
    }
}
