#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Verity Core
//!
//! Durable batch/scan orchestration for a community fact-checking backend.
//!
//! ## Overview
//!
//! Many independent long-running scans run side by side across worker
//! processes that share one store. This crate provides the machinery that
//! keeps them correct under partial failure and at-least-once delivery:
//!
//! - **Job lifecycle**: a pure state machine with once-only timestamps, and a
//!   job service that persists it with compare-and-swap writes
//! - **Circuit breakers**: fail-fast gates over a flaky dependency
//! - **Distributed rate limiting**: named, capacity-bounded permits with
//!   leak prevention and retried, alerting release
//! - **Dual completion**: exactly-once finalization when batch workers and the
//!   dispatcher race to report "nothing more is coming"
//! - **Signaling**: a durable mailbox used by orchestrators and their workers
//!
//! ## Module Organization
//!
//! - [`state_machine`] - Job statuses and legal transitions
//! - [`services`] - Job control surface and stuck-job detection
//! - [`resilience`] - Circuit breakers and their registry
//! - [`rate_limit`] - Distributed semaphore and execution middleware
//! - [`completion`] - Dual-completion race resolver
//! - [`messaging`] - Orchestrator/worker signaling
//! - [`orchestration`] - Scan orchestrator, dispatcher and batch workers
//! - [`store`] - Shared store abstraction (in-memory and PostgreSQL)
//! - [`config`] - Layered configuration
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use verity_core::config::VerityConfig;
//! use verity_core::messaging::InMemoryMailbox;
//! use verity_core::models::JobMetadata;
//! use verity_core::orchestration::{OrchestrationContext, ScanOrchestrator, StaticItemSource};
//! use verity_core::processing::ProcessorFactory;
//! use verity_core::store::InMemoryStore;
//!
//! # async fn example(
//! #     processor: Arc<dyn verity_core::processing::ItemProcessor>,
//! # ) -> verity_core::Result<()> {
//! let config = VerityConfig::default();
//! let context = OrchestrationContext::new(
//!     Arc::new(InMemoryStore::new()),
//!     Arc::new(InMemoryMailbox::new()),
//!     Arc::new(ProcessorFactory::single(processor)),
//!     Arc::new(StaticItemSource::numbered(100)),
//!     &config,
//! );
//! let orchestrator = ScanOrchestrator::new(&context, &config);
//!
//! let job = orchestrator
//!     .jobs()
//!     .create_job("claim_scan", None, JobMetadata::new())
//!     .await?;
//! orchestrator.launch(job.id).await?;
//! let report = orchestrator.run_next(Duration::from_secs(1)).await?;
//! # let _ = report;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit and integration tests
//! DATABASE_URL=postgres://... cargo test -- --ignored   # PostgreSQL backends
//! ```

pub mod completion;
pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod metrics;
pub mod models;
pub mod orchestration;
pub mod processing;
pub mod rate_limit;
pub mod resilience;
pub mod services;
pub mod state_machine;
pub mod store;

pub use completion::{CompletionOutcome, DualCompletionCoordinator, ScanFinalizer};
pub use config::{ConfigManager, VerityConfig};
pub use error::{Result, VerityError};
pub use models::{ErrorSummary, Job, JobFilter, JobMetadata};
pub use rate_limit::{RateLimitError, RateLimitMiddleware};
pub use resilience::{CircuitBreaker, CircuitBreakerRegistry, CircuitState};
pub use services::{BatchJobService, StuckJobDetector};
pub use state_machine::{JobStateMachine, JobStatus};
pub use store::{InMemoryStore, PostgresStore, SharedStore};
