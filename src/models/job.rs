//! # Job Model
//!
//! A batch job (scan run) as persisted in the shared store. Jobs are only ever
//! mutated through [`crate::state_machine::JobStateMachine`] and the
//! [`crate::services::BatchJobService`] built on it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::state_machine::JobStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub status: JobStatus,
    /// Expected unit count; unknown until dispatch completes for some job types
    pub total_tasks: Option<u64>,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_summary: Option<ErrorSummary>,
    #[serde(default)]
    pub metadata: JobMetadata,
    pub created_at: DateTime<Utc>,
    /// Moves on every transition and progress update
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(job_type: impl Into<String>, total_tasks: Option<u64>, metadata: JobMetadata) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type: job_type.into(),
            status: JobStatus::Pending,
            total_tasks,
            completed_tasks: 0,
            failed_tasks: 0,
            started_at: None,
            completed_at: None,
            error_summary: None,
            metadata,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Units accounted for so far (succeeded or failed)
    pub fn processed_tasks(&self) -> u64 {
        self.completed_tasks + self.failed_tasks
    }
}

/// Structured failure detail attached when a job enters FAILED
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Value,
    pub failed_at: DateTime<Utc>,
}

impl ErrorSummary {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: Value::Null,
            failed_at: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Opaque job-type-specific parameters.
///
/// Values are kept exactly as supplied: a `null` scope stays `null` and reads
/// back as "no scope", never as the string `"null"`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobMetadata(Map<String, Value>);

impl JobMetadata {
    pub const SCOPE_ID: &'static str = "scope_id";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// A parameter rendered for interpolation. Absent and `null` are both `None`.
    pub fn param(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            other => Some(other.to_string()),
        }
    }

    /// Scope the job is limited to, if any
    pub fn scope_id(&self) -> Option<String> {
        self.param(Self::SCOPE_ID)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for JobMetadata {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Filter for [`crate::services::BatchJobService::list_jobs`]
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |status| job.status == status)
            && self
                .job_type
                .as_deref()
                .map_or(true, |job_type| job.job_type == job_type)
    }
}
