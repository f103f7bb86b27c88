//! # In-Memory Shared Store
//!
//! Thread-safe, process-local implementation of [`SharedStore`]. Every
//! primitive executes under a single short critical section, which gives the
//! same per-operation atomicity a database backend provides.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;

use super::{SharedStore, StoreResult, VersionedDocument};

#[derive(Debug, Default)]
struct StoreState {
    documents: BTreeMap<String, VersionedDocument>,
    counters: HashMap<String, i64>,
    /// slot name -> holder -> expires at
    slots: HashMap<String, HashMap<Uuid, Instant>>,
}

/// In-memory store for tests and single-process deployments
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents currently stored (for testing)
    pub fn document_count(&self) -> usize {
        self.state.lock().documents.len()
    }
}

fn purge_expired(holders: &mut HashMap<Uuid, Instant>, now: Instant) {
    holders.retain(|_, expires_at| *expires_at > now);
}

#[async_trait]
impl SharedStore for InMemoryStore {
    async fn get_document(&self, key: &str) -> StoreResult<Option<VersionedDocument>> {
        Ok(self.state.lock().documents.get(key).cloned())
    }

    async fn put_document(
        &self,
        key: &str,
        expected_version: Option<u64>,
        value: serde_json::Value,
    ) -> StoreResult<Option<u64>> {
        let mut state = self.state.lock();
        let current = state.documents.get(key).map(|doc| doc.version);

        let next_version = match (current, expected_version) {
            (None, None) => 1,
            (Some(actual), Some(expected)) if actual == expected => actual + 1,
            _ => return Ok(None),
        };

        state.documents.insert(
            key.to_string(),
            VersionedDocument {
                key: key.to_string(),
                value,
                version: next_version,
            },
        );
        Ok(Some(next_version))
    }

    async fn list_documents(&self, prefix: &str) -> StoreResult<Vec<VersionedDocument>> {
        let state = self.state.lock();
        Ok(state
            .documents
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    async fn incr_counter(&self, key: &str, delta: i64) -> StoreResult<i64> {
        let mut state = self.state.lock();
        let value = state.counters.entry(key.to_string()).or_insert(0);
        *value += delta;
        Ok(*value)
    }

    async fn get_counter(&self, key: &str) -> StoreResult<Option<i64>> {
        Ok(self.state.lock().counters.get(key).copied())
    }

    async fn set_counter_if_absent(&self, key: &str, value: i64) -> StoreResult<bool> {
        let mut state = self.state.lock();
        if state.counters.contains_key(key) {
            return Ok(false);
        }
        state.counters.insert(key.to_string(), value);
        Ok(true)
    }

    async fn try_acquire_slot(
        &self,
        name: &str,
        holder: Uuid,
        capacity: u32,
        expiry: Duration,
    ) -> StoreResult<bool> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let holders = state.slots.entry(name.to_string()).or_default();
        purge_expired(holders, now);

        if let Some(expires_at) = holders.get_mut(&holder) {
            *expires_at = now + expiry;
            return Ok(true);
        }

        if holders.len() as u32 >= capacity {
            return Ok(false);
        }

        holders.insert(holder, now + expiry);
        Ok(true)
    }

    async fn release_slot(&self, name: &str, holder: Uuid) -> StoreResult<bool> {
        let mut state = self.state.lock();
        let released = state
            .slots
            .get_mut(name)
            .map(|holders| holders.remove(&holder).is_some())
            .unwrap_or(false);
        Ok(released)
    }

    async fn slot_holders(&self, name: &str) -> StoreResult<u32> {
        let now = Instant::now();
        let mut state = self.state.lock();
        Ok(state
            .slots
            .get_mut(name)
            .map(|holders| {
                purge_expired(holders, now);
                holders.len() as u32
            })
            .unwrap_or(0))
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<u64> {
        let mut state = self.state.lock();
        let before = state.documents.len() + state.counters.len() + state.slots.len();
        state.documents.retain(|key, _| !key.starts_with(prefix));
        state.counters.retain(|key, _| !key.starts_with(prefix));
        state.slots.retain(|key, _| !key.starts_with(prefix));
        let after = state.documents.len() + state.counters.len() + state.slots.len();
        Ok((before - after) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_document_compare_and_swap() {
        let store = InMemoryStore::new();

        assert_eq!(
            store.put_document("job:1", None, json!({"n": 1})).await.unwrap(),
            Some(1)
        );
        // create-if-absent loses once the document exists
        assert_eq!(
            store.put_document("job:1", None, json!({"n": 2})).await.unwrap(),
            None
        );
        // stale version loses
        assert_eq!(
            store.put_document("job:1", Some(7), json!({"n": 2})).await.unwrap(),
            None
        );
        assert_eq!(
            store.put_document("job:1", Some(1), json!({"n": 2})).await.unwrap(),
            Some(2)
        );

        let doc = store.get_document("job:1").await.unwrap().unwrap();
        assert_eq!(doc.version, 2);
        assert_eq!(doc.value, json!({"n": 2}));
    }

    #[tokio::test]
    async fn test_list_documents_by_prefix() {
        let store = InMemoryStore::new();
        store.put_document("job:a", None, json!(1)).await.unwrap();
        store.put_document("job:b", None, json!(2)).await.unwrap();
        store.put_document("scan:a", None, json!(3)).await.unwrap();

        let jobs = store.list_documents("job:").await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].key, "job:a");
        assert_eq!(jobs[1].key, "job:b");
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(InMemoryStore::new());
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.incr_counter("c", 1).await.unwrap() })
            })
            .collect();

        let mut seen = Vec::new();
        for handle in handles {
            seen.push(handle.await.unwrap());
        }
        seen.sort_unstable();

        // post-increment reads are unique and dense
        assert_eq!(seen, (1..=50).collect::<Vec<i64>>());
        assert_eq!(store.get_counter("c").await.unwrap(), Some(50));
    }

    #[tokio::test]
    async fn test_set_counter_if_absent() {
        let store = InMemoryStore::new();
        assert!(store.set_counter_if_absent("flag", 3).await.unwrap());
        assert!(!store.set_counter_if_absent("flag", 9).await.unwrap());
        assert_eq!(store.get_counter("flag").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_slots_respect_capacity_and_release() {
        let store = InMemoryStore::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let expiry = Duration::from_secs(60);

        assert!(store.try_acquire_slot("p", a, 2, expiry).await.unwrap());
        assert!(store.try_acquire_slot("p", b, 2, expiry).await.unwrap());
        assert!(!store.try_acquire_slot("p", c, 2, expiry).await.unwrap());
        // same holder does not consume another slot
        assert!(store.try_acquire_slot("p", a, 2, expiry).await.unwrap());
        assert_eq!(store.slot_holders("p").await.unwrap(), 2);

        assert!(store.release_slot("p", a).await.unwrap());
        assert!(!store.release_slot("p", a).await.unwrap());
        assert!(store.try_acquire_slot("p", c, 2, expiry).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_slot_holders_are_purged() {
        let store = InMemoryStore::new();
        let crashed = Uuid::new_v4();
        let next = Uuid::new_v4();

        assert!(store
            .try_acquire_slot("p", crashed, 1, Duration::from_secs(5))
            .await
            .unwrap());
        assert!(!store
            .try_acquire_slot("p", next, 1, Duration::from_secs(5))
            .await
            .unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;

        assert!(store
            .try_acquire_slot("p", next, 1, Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let store = InMemoryStore::new();
        store.put_document("scan:1:doc", None, json!(1)).await.unwrap();
        store.incr_counter("scan:1:processed", 1).await.unwrap();
        store.incr_counter("scan:2:processed", 1).await.unwrap();

        assert_eq!(store.delete_prefix("scan:1:").await.unwrap(), 2);
        assert_eq!(store.get_counter("scan:2:processed").await.unwrap(), Some(1));
    }
}
