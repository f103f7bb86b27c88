//! # Distributed Semaphore
//!
//! A named, capacity-bounded permit backed by the shared store, so the bound
//! holds across worker processes. Acquisition polls the store with a growing
//! interval; releases made by this process wake local waiters early.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use super::errors::{RateLimitError, RateLimitResult};
use crate::config::RateLimiterConfig;
use crate::constants::keys;
use crate::metrics::resilience as resilience_metrics;
use crate::store::SharedStore;

/// Handle for one acquired slot. Release it exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permit {
    pub name: String,
    pub holder: Uuid,
    pub capacity: u32,
    pub expiry: Duration,
    pub acquired_at: DateTime<Utc>,
}

pub struct DistributedSemaphore {
    store: Arc<dyn SharedStore>,
    poll_interval: Duration,
    max_poll_interval: Duration,
    released: Notify,
}

impl std::fmt::Debug for DistributedSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedSemaphore")
            .field("poll_interval", &self.poll_interval)
            .field("max_poll_interval", &self.max_poll_interval)
            .finish()
    }
}

impl DistributedSemaphore {
    pub fn new(store: Arc<dyn SharedStore>, config: &RateLimiterConfig) -> Self {
        Self {
            store,
            poll_interval: config.poll_interval(),
            max_poll_interval: config.max_poll_interval(),
            released: Notify::new(),
        }
    }

    /// Wait for a slot of `name` until one frees up or `max_wait` elapses.
    ///
    /// `expiry` bounds how long a crashed holder can keep the slot.
    pub async fn acquire(
        &self,
        name: &str,
        capacity: u32,
        max_wait: Duration,
        expiry: Duration,
    ) -> RateLimitResult<Permit> {
        if capacity == 0 {
            return Err(RateLimitError::InvalidPermit {
                name: name.to_string(),
                reason: "capacity must be greater than 0".to_string(),
            });
        }
        if expiry.is_zero() {
            return Err(RateLimitError::InvalidPermit {
                name: name.to_string(),
                reason: "expiry must be greater than 0".to_string(),
            });
        }

        let key = keys::permit(name);
        let holder = Uuid::new_v4();
        let started = Instant::now();
        let deadline = started + max_wait;
        let mut interval = self.poll_interval;

        loop {
            // registered before the attempt so a release in between is not missed
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self
                .store
                .try_acquire_slot(&key, holder, capacity, expiry)
                .await?
            {
                let waited = started.elapsed();
                resilience_metrics::permit_acquisitions_total()
                    .add(1, &[KeyValue::new("permit", name.to_string())]);
                resilience_metrics::permit_wait_duration().record(
                    waited.as_secs_f64() * 1000.0,
                    &[KeyValue::new("permit", name.to_string())],
                );
                debug!(
                    permit = name,
                    holder = %holder,
                    waited_ms = waited.as_millis() as u64,
                    "Permit acquired"
                );
                return Ok(Permit {
                    name: name.to_string(),
                    holder,
                    capacity,
                    expiry,
                    acquired_at: Utc::now(),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                let waited = now.duration_since(started);
                resilience_metrics::permit_timeouts_total()
                    .add(1, &[KeyValue::new("permit", name.to_string())]);
                warn!(
                    permit = name,
                    capacity = capacity,
                    waited_ms = waited.as_millis() as u64,
                    "Permit acquisition timed out"
                );
                return Err(RateLimitError::Exceeded {
                    name: name.to_string(),
                    waited,
                });
            }

            let wait = interval.min(deadline - now);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
            interval = (interval * 2).min(self.max_poll_interval);
        }
    }

    /// Give the slot back. Returns `false` when the holder no longer owned it
    /// (already released, or reclaimed after expiry).
    pub async fn release(&self, permit: &Permit) -> RateLimitResult<bool> {
        let released = self
            .store
            .release_slot(&keys::permit(&permit.name), permit.holder)
            .await?;
        self.released.notify_waiters();

        if !released {
            debug!(
                permit = %permit.name,
                holder = %permit.holder,
                "Permit was not held at release (already released or expired)"
            );
        }
        Ok(released)
    }

    /// Live holders of `name`
    pub async fn holders(&self, name: &str) -> RateLimitResult<u32> {
        Ok(self.store.slot_holders(&keys::permit(name)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn semaphore() -> Arc<DistributedSemaphore> {
        Arc::new(DistributedSemaphore::new(
            Arc::new(InMemoryStore::new()),
            &RateLimiterConfig::default(),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_is_enforced() {
        let sem = semaphore();
        let a = sem
            .acquire("scope:1", 2, Duration::ZERO, Duration::from_secs(60))
            .await
            .unwrap();
        let _b = sem
            .acquire("scope:1", 2, Duration::ZERO, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(sem.holders("scope:1").await.unwrap(), 2);

        let err = sem
            .acquire("scope:1", 2, Duration::from_millis(500), Duration::from_secs(60))
            .await
            .unwrap_err();
        match err {
            RateLimitError::Exceeded { name, waited } => {
                assert_eq!(name, "scope:1");
                assert!(waited >= Duration::from_millis(500));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        // other names are independent
        assert!(sem
            .acquire("scope:2", 1, Duration::ZERO, Duration::from_secs(60))
            .await
            .is_ok());

        assert!(sem.release(&a).await.unwrap());
        assert!(!sem.release(&a).await.unwrap());
        assert_eq!(sem.holders("scope:1").await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_is_woken_by_release() {
        let sem = semaphore();
        let held = sem
            .acquire("scope:1", 1, Duration::ZERO, Duration::from_secs(60))
            .await
            .unwrap();

        let waiter = {
            let sem = Arc::clone(&sem);
            tokio::spawn(async move {
                sem.acquire("scope:1", 1, Duration::from_secs(10), Duration::from_secs(60))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(120)).await;
        sem.release(&held).await.unwrap();

        let permit = waiter.await.unwrap().unwrap();
        assert_eq!(permit.name, "scope:1");
        assert_ne!(permit.holder, held.holder);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_holder_is_reclaimed() {
        let sem = semaphore();
        let _crashed = sem
            .acquire("scope:1", 1, Duration::ZERO, Duration::from_secs(5))
            .await
            .unwrap();

        let permit = sem
            .acquire("scope:1", 1, Duration::from_secs(10), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(permit.name, "scope:1");
    }

    #[tokio::test]
    async fn test_invalid_permit_parameters() {
        let sem = semaphore();
        let err = sem
            .acquire("scope:1", 0, Duration::ZERO, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_configuration_error());

        let err = sem
            .acquire("scope:1", 1, Duration::ZERO, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(err.is_configuration_error());
    }
}
