use thiserror::Error;

use super::states::JobStatus;

/// Errors raised by job state transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateMachineError {
    /// The job is not in a state that permits the requested move. Never retried.
    #[error("Invalid state transition from {current} to {target}")]
    InvalidTransition { current: JobStatus, target: JobStatus },
}

pub type StateMachineResult<T> = Result<T, StateMachineError>;
