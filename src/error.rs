//! Error types for the Verity orchestration core.
//!
//! Each subsystem owns a focused `thiserror` enum; all of them fold into
//! [`VerityError`] so callers one layer up can apply a single retry policy.

use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigurationError;
use crate::messaging::MessagingError;
use crate::rate_limit::RateLimitError;
use crate::resilience::{CircuitBreakerError, CircuitOpenError};
use crate::state_machine::{JobStatus, StateMachineError};
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum VerityError {
    #[error("Invalid state transition from {current} to {target}")]
    InvalidStateTransition { current: JobStatus, target: JobStatus },
    #[error("Job {0} not found")]
    JobNotFound(Uuid),
    #[error("Invalid job state: {0}")]
    InvalidState(String),
    #[error("Circuit breaker open: {0}")]
    CircuitOpen(String),
    #[error("Rate limit exceeded for permit '{name}' after waiting {waited_ms}ms")]
    RateLimitExceeded { name: String, waited_ms: u64 },
    #[error("Rate limit configuration error: {0}")]
    RateLimitConfiguration(String),
    #[error("Store error: {0}")]
    StoreError(String),
    #[error("Messaging error: {0}")]
    MessagingError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Processing error: {0}")]
    ProcessingError(String),
    #[error("Orchestration error: {0}")]
    OrchestrationError(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl VerityError {
    /// Whether a retry policy one layer up may retry the failed operation.
    ///
    /// Circuit-open and rate-limit-exceeded are transient; state machine and
    /// configuration errors are caller mistakes and are surfaced immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen(_)
                | Self::RateLimitExceeded { .. }
                | Self::StoreError(_)
                | Self::MessagingError(_)
        )
    }
}

impl From<StateMachineError> for VerityError {
    fn from(err: StateMachineError) -> Self {
        match err {
            StateMachineError::InvalidTransition { current, target } => {
                Self::InvalidStateTransition { current, target }
            }
        }
    }
}

impl From<RateLimitError> for VerityError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::Exceeded { name, waited } => Self::RateLimitExceeded {
                name,
                waited_ms: waited.as_millis() as u64,
            },
            RateLimitError::Configuration { .. } | RateLimitError::InvalidPermit { .. } => {
                Self::RateLimitConfiguration(err.to_string())
            }
            RateLimitError::Store(store) => Self::StoreError(store.to_string()),
        }
    }
}

impl From<CircuitOpenError> for VerityError {
    fn from(err: CircuitOpenError) -> Self {
        Self::CircuitOpen(err.component)
    }
}

impl<E: Into<VerityError>> From<CircuitBreakerError<E>> for VerityError {
    fn from(err: CircuitBreakerError<E>) -> Self {
        match err {
            CircuitBreakerError::CircuitOpen { component } => Self::CircuitOpen(component),
            CircuitBreakerError::OperationFailed(inner) => inner.into(),
        }
    }
}

impl From<StoreError> for VerityError {
    fn from(err: StoreError) -> Self {
        Self::StoreError(err.to_string())
    }
}

impl From<MessagingError> for VerityError {
    fn from(err: MessagingError) -> Self {
        Self::MessagingError(err.to_string())
    }
}

impl From<ConfigurationError> for VerityError {
    fn from(err: ConfigurationError) -> Self {
        Self::ConfigurationError(err.to_string())
    }
}

impl From<serde_json::Error> for VerityError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VerityError>;
