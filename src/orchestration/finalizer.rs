//! # Job Finalizer
//!
//! The one downstream effect of a finished scan: write the final item counts
//! and move the job to COMPLETED. Late completion against a job that is
//! already terminal (cancelled mid-scan, failed by an operator) is a no-op.

use async_trait::async_trait;
use tracing::{debug, info};

use crate::completion::{ScanCompletion, ScanFinalizer};
use crate::error::{Result, VerityError};
use crate::services::{BatchJobService, FinalCounts};

#[derive(Debug, Clone)]
pub struct JobFinalizer {
    jobs: BatchJobService,
}

impl JobFinalizer {
    pub fn new(jobs: BatchJobService) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl ScanFinalizer for JobFinalizer {
    async fn finalize(&self, completion: &ScanCompletion) -> Result<()> {
        let job_id = completion.scan_id;
        let job = self.jobs.get_job(job_id).await?;

        if job.is_terminal() {
            debug!(
                job_id = %job_id,
                status = %job.status,
                "Scan finished against a terminal job; nothing to finalize"
            );
            return Ok(());
        }

        let counts = FinalCounts {
            completed: completion.items.processed,
            failed: completion.items.failed,
        };

        match self.jobs.complete_job(job_id, counts).await {
            Ok(job) => {
                info!(
                    job_id = %job_id,
                    trigger = completion.trigger.as_str(),
                    completed_tasks = job.completed_tasks,
                    failed_tasks = job.failed_tasks,
                    flagged = completion.items.flagged,
                    "Job completed"
                );
                Ok(())
            }
            // terminated between the read above and the write
            Err(VerityError::InvalidStateTransition { current, .. }) if current.is_terminal() => {
                debug!(job_id = %job_id, status = %current, "Job terminated before finalization");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}
