//! # Job State Machine
//!
//! Pure transition function over [`Job`]. It enforces the transition table and
//! the once-only timestamp invariants; persistence is the caller's concern
//! (see [`crate::services::BatchJobService`]).
//!
//! ```text
//! PENDING ──► IN_PROGRESS ──► COMPLETED
//!    │             │
//!    ├──► FAILED ◄─┤
//!    └──► CANCELLED ◄┘
//! ```
//!
//! A transition to the current state is a no-op that succeeds without touching
//! any field. A rejected transition never mutates the job.

use chrono::{DateTime, Utc};
use tracing::debug;

use super::errors::{StateMachineError, StateMachineResult};
use super::states::JobStatus;
use crate::models::{ErrorSummary, Job};

#[derive(Debug, Clone, Copy, Default)]
pub struct JobStateMachine;

impl JobStateMachine {
    /// Whether `current -> target` is permitted (self transitions always are)
    pub fn can_transition(current: JobStatus, target: JobStatus) -> bool {
        current == target || current.allowed_targets().contains(&target)
    }

    /// Move `job` to `target`, returning the updated job.
    pub fn transition(job: &Job, target: JobStatus, now: DateTime<Utc>) -> StateMachineResult<Job> {
        Self::apply(job, target, None, now)
    }

    /// Move `job` to FAILED and attach the structured error summary.
    pub fn fail(job: &Job, summary: ErrorSummary, now: DateTime<Utc>) -> StateMachineResult<Job> {
        Self::apply(job, JobStatus::Failed, Some(summary), now)
    }

    fn apply(
        job: &Job,
        target: JobStatus,
        error_summary: Option<ErrorSummary>,
        now: DateTime<Utc>,
    ) -> StateMachineResult<Job> {
        let current = job.status;

        if current == target {
            return Ok(job.clone());
        }

        if !Self::can_transition(current, target) {
            return Err(StateMachineError::InvalidTransition { current, target });
        }

        let mut next = job.clone();
        next.status = target;
        next.updated_at = now;

        if target == JobStatus::InProgress && next.started_at.is_none() {
            next.started_at = Some(now);
        }

        if target.is_terminal() && next.completed_at.is_none() {
            next.completed_at = Some(now);
        }

        if target == JobStatus::Failed {
            next.error_summary = error_summary;
        }

        debug!(
            job_id = %job.id,
            from = %current,
            to = %target,
            "Job state transition"
        );

        Ok(next)
    }
}
