//! Per-item work capability and tiered processor selection.

pub mod factory;
pub mod processor;

pub use factory::{ProcessorFactory, ProcessorTier};
pub use processor::{ItemOutcome, ItemProcessor, ProcessingError, WorkItem};
