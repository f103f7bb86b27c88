//! # Orchestrator/Worker Signaling
//!
//! Durable, at-least-once message passing between a scan orchestrator and the
//! batch workers it spawns. Messages are addressed to a destination (the
//! orchestrator's scan id, or the workflow queue) and tagged with a topic.

pub mod client;
pub mod errors;
pub mod in_memory;
pub mod mailbox;
pub mod message;
pub mod postgres;
pub mod signals;

pub use client::{Received, SignalClient};
pub use errors::{MessagingError, MessagingResult};
pub use in_memory::InMemoryMailbox;
pub use mailbox::SignalMailbox;
pub use message::{EnqueueOutcome, MessageId, SignalMessage};
pub use postgres::PostgresMailbox;
pub use signals::{AllTransmitted, BatchComplete, ScanSignal, Signal, WorkflowRequest};
