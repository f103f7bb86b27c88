//! Mailbox message envelope.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::errors::{MessagingError, MessagingResult};

pub type MessageId = i64;

/// A signal as handed to a receiver. Stays invisible to other receivers until
/// acked, released, or its visibility timeout lapses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMessage {
    pub id: MessageId,
    pub destination: String,
    pub topic: String,
    pub payload: serde_json::Value,
    pub dedup_key: Option<String>,
    /// 1 on first delivery; higher values mean redelivery
    pub delivery_count: u32,
    pub sent_at: DateTime<Utc>,
}

impl SignalMessage {
    pub fn decode<T: DeserializeOwned>(&self) -> MessagingResult<T> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| MessagingError::deserialization(&self.topic, e))
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

/// Result of a deduplicated enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued(MessageId),
    /// A message with the same dedup key is still pending or in flight
    Duplicate(MessageId),
}

impl EnqueueOutcome {
    pub fn message_id(&self) -> MessageId {
        match self {
            Self::Enqueued(id) | Self::Duplicate(id) => *id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}
