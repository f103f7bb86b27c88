//! Typed payloads exchanged between a scan orchestrator, its dispatcher and
//! its batch workers.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::{MessagingError, MessagingResult};
use super::message::SignalMessage;
use crate::constants::topics;

/// A payload bound to one topic
pub trait Signal: Serialize + DeserializeOwned + Send + Sync {
    const TOPIC: &'static str;
}

/// Sent by a batch worker when its batch is done
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchComplete {
    pub scan_id: Uuid,
    pub batch_id: u64,
    pub processed: u64,
    pub failed: u64,
    pub flagged: u64,
}

impl Signal for BatchComplete {
    const TOPIC: &'static str = topics::BATCH_COMPLETE;
}

/// Sent once by the dispatcher after it enqueued the last batch worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllTransmitted {
    pub scan_id: Uuid,
    pub expected_total: u64,
}

impl Signal for AllTransmitted {
    const TOPIC: &'static str = topics::ALL_TRANSMITTED;
}

/// Launch request for a scan workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRequest {
    pub job_id: Uuid,
    pub requested_at: DateTime<Utc>,
}

impl Signal for WorkflowRequest {
    const TOPIC: &'static str = topics::WORKFLOW_REQUEST;
}

/// Either completion signal, as received by an orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanSignal {
    BatchComplete(BatchComplete),
    AllTransmitted(AllTransmitted),
}

impl ScanSignal {
    pub const TOPICS: [&'static str; 2] = [topics::BATCH_COMPLETE, topics::ALL_TRANSMITTED];

    pub fn from_message(message: &SignalMessage) -> MessagingResult<Self> {
        match message.topic.as_str() {
            topics::BATCH_COMPLETE => Ok(Self::BatchComplete(message.decode()?)),
            topics::ALL_TRANSMITTED => Ok(Self::AllTransmitted(message.decode()?)),
            other => Err(MessagingError::deserialization(other, "not a scan completion topic")),
        }
    }

    pub fn scan_id(&self) -> Uuid {
        match self {
            Self::BatchComplete(signal) => signal.scan_id,
            Self::AllTransmitted(signal) => signal.scan_id,
        }
    }
}
