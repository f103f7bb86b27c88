//! # Messaging Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MessagingError {
    #[error("Database query error: {operation}: {message}")]
    DatabaseQuery { operation: String, message: String },

    #[error("Message serialization error: {message}")]
    MessageSerialization { message: String },

    #[error("Message deserialization error on topic {topic}: {message}")]
    MessageDeserialization { topic: String, message: String },

    #[error("Invalid destination {destination}: {reason}")]
    InvalidDestination { destination: String, reason: String },

    #[error("Internal messaging error: {message}")]
    Internal { message: String },
}

impl MessagingError {
    pub fn database_query(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::DatabaseQuery {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn deserialization(topic: impl Into<String>, message: impl ToString) -> Self {
        Self::MessageDeserialization {
            topic: topic.into(),
            message: message.to_string(),
        }
    }

    pub fn invalid_destination(destination: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDestination {
            destination: destination.into(),
            reason: reason.into(),
        }
    }
}

impl From<sqlx::Error> for MessagingError {
    fn from(err: sqlx::Error) -> Self {
        Self::database_query("signal mailbox", err)
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        Self::MessageSerialization {
            message: err.to_string(),
        }
    }
}

pub type MessagingResult<T> = Result<T, MessagingError>;
