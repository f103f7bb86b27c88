// Job lifecycle state machine
//
// Legal status transitions and the once-only started_at/completed_at
// invariants for batch jobs.

pub mod errors;
pub mod job_state_machine;
pub mod states;

pub use errors::{StateMachineError, StateMachineResult};
pub use job_state_machine::JobStateMachine;
pub use states::JobStatus;
