//! # Item Processor
//!
//! The opaque per-item capability a batch worker drives. Expected alternate
//! outcomes (content filtered, retry later) are values; only genuine faults
//! are errors, and only errors count against a circuit breaker.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::VerityError;

/// One unit of work inside a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: String,
    pub scan_id: Uuid,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl WorkItem {
    pub fn new(scan_id: Uuid, id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            scan_id,
            payload,
        }
    }

    /// Unique id used for permit bookkeeping
    pub fn task_id(&self) -> String {
        format!("{}:{}", self.scan_id, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ItemOutcome {
    /// Item evaluated; `flagged` marks it for community review
    Processed { flagged: bool },
    /// Transient refusal (e.g. content filter); the same item may be tried again
    RetryNeeded { reason: String },
    /// Permanently refused; counted as failed, not retried
    Filtered { reason: String },
}

impl ItemOutcome {
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::RetryNeeded { .. })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessingError {
    #[error("Processing failed for item {item_id}: {message}")]
    Failed { item_id: String, message: String },

    #[error("Processor unavailable: {message}")]
    Unavailable { message: String },

    #[error("Invalid work item {item_id}: {reason}")]
    InvalidItem { item_id: String, reason: String },
}

impl ProcessingError {
    pub fn failed(item_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            item_id: item_id.into(),
            message: message.into(),
        }
    }

    /// Invalid input says nothing about the health of the dependency
    pub fn is_dependency_fault(&self) -> bool {
        !matches!(self, Self::InvalidItem { .. })
    }
}

impl From<ProcessingError> for VerityError {
    fn from(err: ProcessingError) -> Self {
        Self::ProcessingError(err.to_string())
    }
}

#[async_trait]
pub trait ItemProcessor: Send + Sync {
    /// Short identifier for logs
    fn name(&self) -> &str;

    async fn process(&self, item: &WorkItem) -> Result<ItemOutcome, ProcessingError>;
}
