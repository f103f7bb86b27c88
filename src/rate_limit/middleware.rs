//! # Rate Limit Middleware
//!
//! Wraps one unit of work with acquire-before / release-after semantics:
//!
//! 1. resolve the permit name from its template (misconfiguration fails at once)
//! 2. a task id already in flight reuses the original permit instead of
//!    acquiring a second one
//! 3. the acquired permit is remembered by task id while the work runs
//! 4. afterwards the permit is forgotten and released with retry and backoff
//!
//! Release failures are absorbed into metrics and alerts; they never replace
//! the work's own result. A permit whose release is lost is bounded by its
//! expiry.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

use super::errors::RateLimitError;
use super::metrics::RateLimitMetrics;
use super::retry::ReleaseRetryPolicy;
use super::semaphore::{DistributedSemaphore, Permit};
use super::template::resolve_permit_name;
use crate::config::RateLimiterConfig;
use crate::models::JobMetadata;

/// Permit settings for one kind of work
#[derive(Debug, Clone, PartialEq)]
pub struct PermitPolicy {
    /// Permit name, possibly with `{placeholder}` segments
    pub template: String,
    pub capacity: u32,
    pub max_wait: Duration,
    pub expiry: Duration,
}

impl PermitPolicy {
    pub fn new(template: impl Into<String>, capacity: u32, max_wait: Duration, expiry: Duration) -> Self {
        Self {
            template: template.into(),
            capacity,
            max_wait,
            expiry,
        }
    }

    /// Policy using the configured default capacity, wait and expiry
    pub fn from_config(template: impl Into<String>, config: &RateLimiterConfig) -> Self {
        Self {
            template: template.into(),
            capacity: config.default_capacity,
            max_wait: Duration::from_secs(config.default_max_wait_seconds),
            expiry: Duration::from_secs(config.default_expiry_seconds),
        }
    }
}

/// In-flight entry: `None` while the owner is still acquiring
type InFlight = DashMap<String, Option<Permit>>;

pub struct RateLimitMiddleware {
    semaphore: Arc<DistributedSemaphore>,
    in_flight: Arc<InFlight>,
    retry_policy: ReleaseRetryPolicy,
    metrics: Arc<RateLimitMetrics>,
}

impl std::fmt::Debug for RateLimitMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitMiddleware")
            .field("in_flight", &self.in_flight.len())
            .field("retry_policy", &self.retry_policy)
            .finish()
    }
}

impl RateLimitMiddleware {
    pub fn new(
        semaphore: Arc<DistributedSemaphore>,
        retry_policy: ReleaseRetryPolicy,
        metrics: Arc<RateLimitMetrics>,
    ) -> Self {
        Self {
            semaphore,
            in_flight: Arc::new(DashMap::new()),
            retry_policy,
            metrics,
        }
    }

    /// Middleware reporting into the process-wide [`RateLimitMetrics::global_with`]
    pub fn from_config(semaphore: Arc<DistributedSemaphore>, config: &RateLimiterConfig) -> Self {
        Self::new(
            semaphore,
            config.release_retry.to_policy(),
            RateLimitMetrics::global_with(config.alert_threshold),
        )
    }

    pub fn metrics(&self) -> &Arc<RateLimitMetrics> {
        &self.metrics
    }

    pub fn semaphore(&self) -> &Arc<DistributedSemaphore> {
        &self.semaphore
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_in_flight(&self, task_id: &str) -> bool {
        self.in_flight.contains_key(task_id)
    }

    /// Run `work` while holding the permit described by `policy`.
    ///
    /// Busy and misconfigured permits surface as `E::from(RateLimitError)`
    /// without running `work`.
    pub async fn execute<F, Fut, T, E>(
        &self,
        task_id: &str,
        policy: &PermitPolicy,
        params: &JobMetadata,
        work: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<RateLimitError>,
    {
        let name = resolve_permit_name(&policy.template, params)?;

        let owner = match self.in_flight.entry(task_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(None);
                true
            }
        };

        if !owner {
            self.metrics.record_leak_prevented(&name, task_id);
            return work().await;
        }

        let mut guard = InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            semaphore: Arc::clone(&self.semaphore),
            task_id: task_id.to_string(),
            armed: true,
        };

        let permit = self
            .semaphore
            .acquire(&name, policy.capacity, policy.max_wait, policy.expiry)
            .await?;
        if let Some(mut slot) = self.in_flight.get_mut(task_id) {
            *slot = Some(permit.clone());
        }

        let result = work().await;

        guard.armed = false;
        self.in_flight.remove(task_id);
        self.release_with_retry(&permit).await;

        result
    }

    /// Release with the retry budget. Returns whether the release succeeded.
    pub async fn release_with_retry(&self, permit: &Permit) -> bool {
        let max_attempts = self.retry_policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match self.semaphore.release(permit).await {
                Ok(_) => {
                    self.metrics.record_release_success();
                    debug!(permit = %permit.name, attempt = attempt, "Permit released");
                    return true;
                }
                Err(err) if attempt < max_attempts => {
                    self.metrics
                        .record_release_retry(&permit.name, attempt, &err.to_string());
                    tokio::time::sleep(self.retry_policy.delay_for_attempt(attempt)).await;
                }
                Err(err) => {
                    self.metrics
                        .record_release_failure(&permit.name, attempt, &err.to_string());
                }
            }
        }

        false
    }
}

/// Clears the in-flight entry if `execute` is dropped before it finishes
/// (cancellation or panic), releasing any permit in the background.
struct InFlightGuard {
    in_flight: Arc<InFlight>,
    semaphore: Arc<DistributedSemaphore>,
    task_id: String,
    armed: bool,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let Some((_, permit)) = self.in_flight.remove(&self.task_id) else {
            return;
        };
        let Some(permit) = permit else {
            return;
        };

        warn!(
            task_id = %self.task_id,
            permit = %permit.name,
            "Execution ended abnormally while holding a permit; releasing in background"
        );

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let semaphore = Arc::clone(&self.semaphore);
            handle.spawn(async move {
                if let Err(err) = semaphore.release(&permit).await {
                    warn!(
                        permit = %permit.name,
                        error = %err,
                        "Background permit release failed; expiry will reclaim it"
                    );
                }
            });
        }
    }
}
