//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use verity_core::completion::{ScanCompletion, ScanFinalizer};
use verity_core::config::VerityConfig;
use verity_core::processing::{ItemOutcome, ItemProcessor, ProcessingError, WorkItem};
use verity_core::store::{InMemoryStore, SharedStore, StoreError, StoreResult, VersionedDocument};

/// Installs a test subscriber once; `RUST_LOG` controls verbosity
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Configuration tuned for fast tests: tight polling, short receive waits
pub fn test_config() -> VerityConfig {
    let mut config = VerityConfig::default();
    config.environment = "test".to_string();
    config.rate_limiter.poll_interval_ms = 5;
    config.rate_limiter.max_poll_interval_ms = 20;
    config.rate_limiter.release_retry.base_delay_ms = 1;
    config.rate_limiter.release_retry.max_delay_ms = 5;
    config.signaling.poll_interval_ms = 5;
    config.orchestration.batch_size = 3;
    config.orchestration.signal_receive_timeout_seconds = 1;
    config.orchestration.max_idle_receives = 3;
    config
}

/// In-memory store whose `release_slot` fails a scripted number of times
pub struct FlakyStore {
    inner: InMemoryStore,
    release_failures: AtomicU32,
    release_calls: AtomicU32,
}

impl FlakyStore {
    pub fn new(release_failures: u32) -> Self {
        Self {
            inner: InMemoryStore::new(),
            release_failures: AtomicU32::new(release_failures),
            release_calls: AtomicU32::new(0),
        }
    }

    pub fn fail_next_releases(&self, n: u32) {
        self.release_failures.store(n, Ordering::SeqCst);
    }

    pub fn release_calls(&self) -> u32 {
        self.release_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SharedStore for FlakyStore {
    async fn get_document(&self, key: &str) -> StoreResult<Option<VersionedDocument>> {
        self.inner.get_document(key).await
    }

    async fn put_document(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: serde_json::Value,
    ) -> StoreResult<Option<u64>> {
        self.inner.put_document(key, expected_version, value).await
    }

    async fn list_documents(&self, prefix: &str) -> StoreResult<Vec<VersionedDocument>> {
        self.inner.list_documents(prefix).await
    }

    async fn incr_counter(&self, key: &str, delta: i64) -> StoreResult<i64> {
        self.inner.incr_counter(key, delta).await
    }

    async fn get_counter(&self, key: &str) -> StoreResult<Option<i64>> {
        self.inner.get_counter(key).await
    }

    async fn set_counter_if_absent(&self, key: &str, value: i64) -> StoreResult<bool> {
        self.inner.set_counter_if_absent(key, value).await
    }

    async fn try_acquire_slot(
        &self,
        name: &str,
        holder: Uuid,
        capacity: u32,
        expiry: Duration,
    ) -> StoreResult<bool> {
        self.inner.try_acquire_slot(name, holder, capacity, expiry).await
    }

    async fn release_slot(&self, name: &str, holder: Uuid) -> StoreResult<bool> {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .release_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::backend("release_slot", "connection reset"));
        }
        self.inner.release_slot(name, holder).await
    }

    async fn slot_holders(&self, name: &str) -> StoreResult<u32> {
        self.inner.slot_holders(name).await
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<u64> {
        self.inner.delete_prefix(prefix).await
    }
}

/// Finalizer that records every call
#[derive(Default)]
pub struct RecordingFinalizer {
    calls: Mutex<Vec<ScanCompletion>>,
}

impl RecordingFinalizer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<ScanCompletion> {
        self.calls.lock().clone()
    }

    pub fn count_for(&self, scan_id: Uuid) -> usize {
        self.calls.lock().iter().filter(|c| c.scan_id == scan_id).count()
    }
}

#[async_trait]
impl ScanFinalizer for RecordingFinalizer {
    async fn finalize(&self, completion: &ScanCompletion) -> verity_core::Result<()> {
        self.calls.lock().push(completion.clone());
        Ok(())
    }
}

/// Item processor with per-item scripted outcomes; unscripted items succeed
#[derive(Default)]
pub struct ScriptedProcessor {
    script: Mutex<HashMap<String, Vec<Result<ItemOutcome, ProcessingError>>>>,
    delay: Option<Duration>,
    calls: AtomicU32,
}

impl ScriptedProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn script(self, item_id: &str, outcomes: Vec<Result<ItemOutcome, ProcessingError>>) -> Self {
        self.script.lock().insert(item_id.to_string(), outcomes);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ItemProcessor for ScriptedProcessor {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn process(&self, item: &WorkItem) -> Result<ItemOutcome, ProcessingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = {
            let mut script = self.script.lock();
            script
                .get_mut(&item.id)
                .filter(|outcomes| !outcomes.is_empty())
                .map(|outcomes| outcomes.remove(0))
        };
        next.unwrap_or(Ok(ItemOutcome::Processed { flagged: false }))
    }
}
