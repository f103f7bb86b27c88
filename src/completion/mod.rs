//! Finish-last race resolution between batch workers and the dispatcher.

pub mod coordinator;

pub use coordinator::{
    BatchTally, CompletionOutcome, CompletionTrigger, DualCompletionCoordinator,
    DualCompletionState, ScanCompletion, ScanFinalizer,
};
