//! # Batch Job Service
//!
//! Job control surface over the shared store. Every mutation loads the job,
//! applies a pure [`JobStateMachine`] transition and writes back with a
//! compare-and-swap on the document version, retrying on conflict. Two
//! processes racing on the same job therefore never overwrite each other.

use std::sync::Arc;

use chrono::Utc;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::constants::{keys, MAX_JOB_WRITE_ATTEMPTS};
use crate::error::{Result, VerityError};
use crate::logging::log_job_operation;
use crate::metrics::orchestration as orchestration_metrics;
use crate::models::{ErrorSummary, Job, JobFilter, JobMetadata};
use crate::state_machine::{JobStateMachine, JobStatus};
use crate::store::SharedStore;

/// Counts written when a job completes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalCounts {
    pub completed: u64,
    pub failed: u64,
}

#[derive(Clone)]
pub struct BatchJobService {
    store: Arc<dyn SharedStore>,
}

impl std::fmt::Debug for BatchJobService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchJobService").finish_non_exhaustive()
    }
}

impl BatchJobService {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    pub async fn create_job(
        &self,
        job_type: &str,
        total_tasks: Option<u64>,
        metadata: JobMetadata,
    ) -> Result<Job> {
        let job = Job::new(job_type, total_tasks, metadata);
        let created = self
            .store
            .put_document(&keys::job(job.id), None, serde_json::to_value(&job)?)
            .await?;
        if created.is_none() {
            return Err(VerityError::Internal(format!("job {} already exists", job.id)));
        }

        log_job_operation("create_job", Some(job.id), Some(job_type), "pending", None);
        Ok(job)
    }

    pub async fn find_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        match self.store.get_document(&keys::job(job_id)).await? {
            Some(document) => Ok(Some(serde_json::from_value(document.value)?)),
            None => Ok(None),
        }
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<Job> {
        self.find_job(job_id)
            .await?
            .ok_or(VerityError::JobNotFound(job_id))
    }

    pub async fn start_job(&self, job_id: Uuid) -> Result<Job> {
        self.mutate(job_id, "start_job", |job| {
            Self::changed(job, JobStateMachine::transition(job, JobStatus::InProgress, Utc::now())?)
        })
        .await
    }

    /// Record progress. Counters only move forward; a terminal job ignores the
    /// update and a PENDING job rejects it.
    pub async fn update_progress(&self, job_id: Uuid, completed: u64, failed: u64) -> Result<Job> {
        self.mutate(job_id, "update_progress", |job| match job.status {
            JobStatus::Pending => Err(VerityError::InvalidState(format!(
                "job {} has not started; progress cannot be recorded",
                job.id
            ))),
            status if status.is_terminal() => {
                debug!(job_id = %job.id, status = %status, "Ignoring progress for terminal job");
                Ok(None)
            }
            _ => {
                let mut next = job.clone();
                next.completed_tasks = job.completed_tasks.max(completed);
                next.failed_tasks = job.failed_tasks.max(failed);
                if next.completed_tasks == job.completed_tasks && next.failed_tasks == job.failed_tasks {
                    return Ok(None);
                }
                next.updated_at = Utc::now();
                Ok(Some(next))
            }
        })
        .await
    }

    /// Record the unit count dispatch actually found. It replaces any estimate
    /// given at creation; a terminal job keeps what it has.
    pub async fn set_total_tasks(&self, job_id: Uuid, total_tasks: u64) -> Result<Job> {
        self.mutate(job_id, "set_total_tasks", |job| {
            if job.is_terminal() || job.total_tasks == Some(total_tasks) {
                return Ok(None);
            }
            if let Some(estimate) = job.total_tasks {
                info!(
                    job_id = %job.id,
                    estimate = estimate,
                    total_tasks = total_tasks,
                    "Replacing estimated total_tasks with dispatched count"
                );
            }
            let mut next = job.clone();
            next.total_tasks = Some(total_tasks);
            next.updated_at = Utc::now();
            Ok(Some(next))
        })
        .await
    }

    pub async fn complete_job(&self, job_id: Uuid, counts: FinalCounts) -> Result<Job> {
        self.mutate(job_id, "complete_job", |job| {
            if job.status == JobStatus::Completed {
                return Ok(None);
            }
            let mut next = JobStateMachine::transition(job, JobStatus::Completed, Utc::now())?;
            next.completed_tasks = job.completed_tasks.max(counts.completed);
            next.failed_tasks = job.failed_tasks.max(counts.failed);
            Ok(Some(next))
        })
        .await
    }

    pub async fn fail_job(&self, job_id: Uuid, summary: ErrorSummary) -> Result<Job> {
        self.mutate(job_id, "fail_job", |job| {
            Self::changed(job, JobStateMachine::fail(job, summary.clone(), Utc::now())?)
        })
        .await
    }

    pub async fn cancel_job(&self, job_id: Uuid) -> Result<Job> {
        self.mutate(job_id, "cancel_job", |job| {
            Self::changed(job, JobStateMachine::transition(job, JobStatus::Cancelled, Utc::now())?)
        })
        .await
    }

    /// Jobs matching `filter`, oldest first
    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut jobs = Vec::new();
        for document in self.store.list_documents(keys::JOB_PREFIX).await? {
            let job: Job = serde_json::from_value(document.value)?;
            if filter.matches(&job) {
                jobs.push(job);
            }
        }

        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    fn changed(job: &Job, next: Job) -> Result<Option<Job>> {
        Ok((next != *job).then_some(next))
    }

    /// Load, apply `change`, CAS-write. `change` returning `None` leaves the
    /// stored job as is.
    async fn mutate<F>(&self, job_id: Uuid, operation: &str, change: F) -> Result<Job>
    where
        F: Fn(&Job) -> Result<Option<Job>>,
    {
        let key = keys::job(job_id);

        for attempt in 1..=MAX_JOB_WRITE_ATTEMPTS {
            let document = self
                .store
                .get_document(&key)
                .await?
                .ok_or(VerityError::JobNotFound(job_id))?;
            let job: Job = serde_json::from_value(document.value)?;

            let Some(next) = change(&job)? else {
                return Ok(job);
            };

            let written = self
                .store
                .put_document(&key, Some(document.version), serde_json::to_value(&next)?)
                .await?;

            if written.is_some() {
                if next.status != job.status {
                    orchestration_metrics::job_transitions_total().add(
                        1,
                        &[
                            KeyValue::new("from", job.status.to_string()),
                            KeyValue::new("to", next.status.to_string()),
                        ],
                    );
                }
                log_job_operation(
                    operation,
                    Some(job_id),
                    Some(&next.job_type),
                    &next.status.to_string(),
                    None,
                );
                return Ok(next);
            }

            debug!(
                job_id = %job_id,
                operation = operation,
                attempt = attempt,
                "Job write conflict; retrying"
            );
        }

        warn!(
            job_id = %job_id,
            operation = operation,
            attempts = MAX_JOB_WRITE_ATTEMPTS,
            "Giving up on contended job write"
        );
        Err(VerityError::StoreError(format!(
            "job {job_id}: {operation} lost {MAX_JOB_WRITE_ATTEMPTS} consecutive write races"
        )))
    }
}
