//! # Scan Orchestration
//!
//! Concrete dual-completion workflow: an orchestrator, the dispatcher that
//! fans items out to batch workers, and the finalizer that completes the job.

pub mod batch_worker;
pub mod dispatcher;
pub mod finalizer;
pub mod orchestrator;
pub mod source;

pub use batch_worker::{Batch, BatchWorker};
pub use dispatcher::{Dispatched, ScanDispatcher};
pub use finalizer::JobFinalizer;
pub use orchestrator::{OrchestrationContext, ScanOrchestrator, ScanOutcome, ScanReport};
pub use source::{ItemSource, StaticItemSource};
