//! # Shared Store
//!
//! The shared key-value store is the single source of truth for job, counter,
//! flag and permit state. Components never coordinate through in-process locks
//! that another process would depend on; every cross-worker critical section is
//! one of the atomic primitives on [`SharedStore`]:
//!
//! - versioned documents with compare-and-swap writes
//! - counters with atomic increment-and-get and set-if-absent
//! - bounded semaphore slots with a per-holder expiry
//!
//! Two backends ship with the crate: [`InMemoryStore`] for tests and single
//! process deployments, and [`PostgresStore`] for multi-process deployments.

pub mod in_memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use in_memory::InMemoryStore;
pub use postgres::PostgresStore;

/// A JSON document together with its write version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedDocument {
    pub key: String,
    pub value: serde_json::Value,
    pub version: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store backend error during {operation}: {message}")]
    Backend { operation: String, message: String },

    #[error("Store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid store argument: {0}")]
    InvalidArgument(String),
}

impl StoreError {
    pub fn backend(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Backend {
            operation: operation.into(),
            message: message.to_string(),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::backend("database", err)
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Atomic primitives shared by every process that takes part in a scan.
#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    /// Read a document and its current version.
    async fn get_document(&self, key: &str) -> StoreResult<Option<VersionedDocument>>;

    /// Compare-and-swap write.
    ///
    /// `expected_version = None` creates the document only if it is absent.
    /// Returns the new version, or `None` when the expectation did not hold.
    async fn put_document(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: serde_json::Value,
    ) -> StoreResult<Option<u64>>;

    /// All documents whose key starts with `prefix`, ordered by key.
    async fn list_documents(&self, prefix: &str) -> StoreResult<Vec<VersionedDocument>>;

    /// Atomically add `delta` and return the value after the increment.
    async fn incr_counter(&self, key: &str, delta: i64) -> StoreResult<i64>;

    async fn get_counter(&self, key: &str) -> StoreResult<Option<i64>>;

    /// Set the counter only if it does not exist yet. Returns whether this call set it.
    async fn set_counter_if_absent(&self, key: &str, value: i64) -> StoreResult<bool>;

    /// Take one of `capacity` slots for `holder`, purging expired holders first.
    ///
    /// Re-acquiring with a holder that already owns a slot refreshes its expiry
    /// and succeeds without consuming a second slot.
    async fn try_acquire_slot(
        &self,
        name: &str,
        holder: Uuid,
        capacity: u32,
        expiry: Duration,
    ) -> StoreResult<bool>;

    /// Give a slot back. Returns `false` if `holder` did not own one.
    async fn release_slot(&self, name: &str, holder: Uuid) -> StoreResult<bool>;

    /// Number of live (unexpired) holders for a slot name.
    async fn slot_holders(&self, name: &str) -> StoreResult<u32>;

    /// Remove every document, counter and slot under `prefix`. Returns entries removed.
    async fn delete_prefix(&self, prefix: &str) -> StoreResult<u64>;
}
