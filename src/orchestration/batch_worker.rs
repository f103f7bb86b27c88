//! # Batch Worker
//!
//! Processes one batch of items and reports back to the orchestrator that
//! spawned it. Each item runs under a rate-limit permit and behind the item
//! processor's circuit breaker; retry-needed outcomes get a bounded number of
//! further attempts.

use std::sync::Arc;

use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::completion::BatchTally;
use crate::error::{Result, VerityError};
use crate::messaging::{BatchComplete, SignalClient};
use crate::metrics::orchestration as orchestration_metrics;
use crate::models::JobMetadata;
use crate::processing::{ItemOutcome, ItemProcessor, ProcessingError, WorkItem};
use crate::rate_limit::{PermitPolicy, RateLimitMiddleware};
use crate::resilience::CircuitBreaker;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub scan_id: Uuid,
    pub batch_id: u64,
    pub items: Vec<WorkItem>,
}

impl Batch {
    /// Split `items` into consecutive batches of at most `batch_size`
    pub fn plan(scan_id: Uuid, items: Vec<WorkItem>, batch_size: usize) -> Vec<Batch> {
        let batch_size = batch_size.max(1);
        let mut batches = Vec::with_capacity(items.len().div_ceil(batch_size));
        let mut items = items.into_iter().peekable();
        let mut batch_id = 0;

        while items.peek().is_some() {
            batches.push(Batch {
                scan_id,
                batch_id,
                items: items.by_ref().take(batch_size).collect(),
            });
            batch_id += 1;
        }
        batches
    }
}

pub struct BatchWorker {
    middleware: Arc<RateLimitMiddleware>,
    breaker: Option<Arc<CircuitBreaker>>,
    signals: SignalClient,
    policy: PermitPolicy,
    max_filter_retries: u32,
}

impl std::fmt::Debug for BatchWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchWorker")
            .field("breaker", &self.breaker.as_ref().map(|b| b.name().to_string()))
            .field("policy", &self.policy)
            .field("max_filter_retries", &self.max_filter_retries)
            .finish()
    }
}

impl BatchWorker {
    /// `breaker = None` runs the processor unguarded (breakers disabled)
    pub fn new(
        middleware: Arc<RateLimitMiddleware>,
        breaker: Option<Arc<CircuitBreaker>>,
        signals: SignalClient,
        policy: PermitPolicy,
        max_filter_retries: u32,
    ) -> Self {
        Self {
            middleware,
            breaker,
            signals,
            policy,
            max_filter_retries,
        }
    }

    /// Process every item, then send `batch_complete` to the scan.
    ///
    /// Item failures are tallied, never propagated; only a failure to signal
    /// the orchestrator is returned as an error.
    pub async fn run(
        &self,
        batch: &Batch,
        processor: Arc<dyn ItemProcessor>,
        params: &JobMetadata,
    ) -> Result<BatchComplete> {
        let started = Instant::now();
        let mut tally = BatchTally::default();

        for (index, item) in batch.items.iter().enumerate() {
            match self.process_item(item, processor.as_ref(), params).await {
                Ok(ItemOutcome::Processed { flagged }) => {
                    tally.processed += 1;
                    if flagged {
                        tally.flagged += 1;
                    }
                }
                Ok(ItemOutcome::RetryNeeded { reason }) => {
                    warn!(
                        scan_id = %batch.scan_id,
                        item_id = %item.id,
                        reason = %reason,
                        "Item still refused after retries"
                    );
                    tally.failed += 1;
                }
                Ok(ItemOutcome::Filtered { reason }) => {
                    debug!(scan_id = %batch.scan_id, item_id = %item.id, reason = %reason, "Item filtered");
                    tally.failed += 1;
                }
                Err(VerityError::RateLimitConfiguration(message)) => {
                    // every remaining item would resolve the same template
                    error!(
                        scan_id = %batch.scan_id,
                        batch_id = batch.batch_id,
                        error = %message,
                        "Permit misconfigured; failing the rest of the batch"
                    );
                    tally.failed += (batch.items.len() - index) as u64;
                    break;
                }
                Err(err) => {
                    warn!(
                        scan_id = %batch.scan_id,
                        item_id = %item.id,
                        error = %err,
                        retryable = err.is_retryable(),
                        "Item failed"
                    );
                    tally.failed += 1;
                }
            }
        }

        let signal = BatchComplete {
            scan_id: batch.scan_id,
            batch_id: batch.batch_id,
            processed: tally.processed,
            failed: tally.failed,
            flagged: tally.flagged,
        };
        self.signals.send(&batch.scan_id.to_string(), &signal).await?;

        let elapsed = started.elapsed();
        orchestration_metrics::batch_duration().record(
            elapsed.as_secs_f64() * 1000.0,
            &[KeyValue::new("processor", processor.name().to_string())],
        );
        info!(
            scan_id = %batch.scan_id,
            batch_id = batch.batch_id,
            processed = tally.processed,
            failed = tally.failed,
            flagged = tally.flagged,
            duration_ms = elapsed.as_millis() as u64,
            "Batch complete"
        );

        Ok(signal)
    }

    async fn process_item(
        &self,
        item: &WorkItem,
        processor: &dyn ItemProcessor,
        params: &JobMetadata,
    ) -> Result<ItemOutcome> {
        let task_id = item.task_id();
        let mut retries = 0;

        loop {
            let outcome = self
                .middleware
                .execute(&task_id, &self.policy, params, || self.guarded(processor, item))
                .await?;

            match outcome {
                ItemOutcome::RetryNeeded { reason } if retries < self.max_filter_retries => {
                    retries += 1;
                    debug!(
                        item_id = %item.id,
                        retry = retries,
                        reason = %reason,
                        "Retrying refused item"
                    );
                }
                other => return Ok(other),
            }
        }
    }

    async fn guarded(&self, processor: &dyn ItemProcessor, item: &WorkItem) -> Result<ItemOutcome> {
        match &self.breaker {
            Some(breaker) => Ok(breaker
                .call_filtered(|| processor.process(item), ProcessingError::is_dependency_fault)
                .await?),
            None => Ok(processor.process(item).await?),
        }
    }
}
