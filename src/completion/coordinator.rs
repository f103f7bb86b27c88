//! # Dual Completion Coordinator
//!
//! Two independent signals report that a scan has nothing more coming:
//! every batch worker reports its own batch, and the dispatcher reports the
//! final batch count once it stops dispatching. Either may arrive last.
//!
//! Per scan the shared store holds:
//!
//! - one tally document per batch, created only if absent
//! - `expected_total`: set-if-absent, written by the first dispatch signal
//! - `finalized`: set-if-absent guard taken by whichever path finalizes
//!
//! The processed count and item totals are always derived from the batch
//! documents, so a signal redelivered after a failed store call is counted
//! exactly once. Each path performs its own write and then reads the other
//! value. When both writes are visible to both reads, both paths observe the
//! crossing; the `finalized` guard makes exactly one of them run the
//! finalizer. Any error after the guard is taken gives it back.

use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::constants::keys;
use crate::error::Result;
use crate::metrics::orchestration as orchestration_metrics;
use crate::store::{SharedStore, StoreError};

/// Which of the two completion paths observed the crossing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionTrigger {
    WorkerFinished,
    DispatchFinished,
}

impl CompletionTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkerFinished => "worker_finished",
            Self::DispatchFinished => "dispatch_finished",
        }
    }
}

/// Item counts reported by one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BatchTally {
    pub processed: u64,
    pub failed: u64,
    pub flagged: u64,
}

/// Handed to the finalizer once per scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCompletion {
    pub scan_id: Uuid,
    pub trigger: CompletionTrigger,
    /// Batches counted
    pub processed_batches: u64,
    pub expected_batches: u64,
    /// Item totals across all counted batches
    pub items: BatchTally,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The finish line has not been crossed yet
    Pending {
        processed: u64,
        expected_total: Option<u64>,
    },
    /// This call ran the finalizer
    Finalized(ScanCompletion),
    /// The crossing was observed but another path already finalized
    AlreadyFinalized,
}

impl CompletionOutcome {
    pub fn is_finalized(&self) -> bool {
        matches!(self, Self::Finalized(_))
    }
}

/// Persisted per-scan completion state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DualCompletionState {
    pub processed_count: u64,
    pub expected_total: Option<u64>,
    pub finalized: bool,
}

/// Downstream "scan complete" effect. Invoked at most once per scan in the
/// steady state, but must tolerate a repeat call.
#[async_trait]
pub trait ScanFinalizer: Send + Sync {
    async fn finalize(&self, completion: &ScanCompletion) -> Result<()>;
}

pub struct DualCompletionCoordinator {
    store: Arc<dyn SharedStore>,
    finalizer: Arc<dyn ScanFinalizer>,
}

impl std::fmt::Debug for DualCompletionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DualCompletionCoordinator").finish_non_exhaustive()
    }
}

impl DualCompletionCoordinator {
    pub fn new(store: Arc<dyn SharedStore>, finalizer: Arc<dyn ScanFinalizer>) -> Self {
        Self { store, finalizer }
    }

    /// Worker path: record the batch once, then check whether dispatch
    /// already reported a total that this batch reaches.
    pub async fn on_worker_finished(
        &self,
        scan_id: Uuid,
        batch_id: u64,
        tally: BatchTally,
    ) -> Result<CompletionOutcome> {
        let created = self
            .store
            .put_document(
                &keys::scan_batch(scan_id, batch_id),
                None,
                serde_json::to_value(tally)?,
            )
            .await?;

        if created.is_none() {
            orchestration_metrics::duplicate_completion_signals_total()
                .add(1, &[KeyValue::new("topic", "batch_complete")]);
            debug!(
                scan_id = %scan_id,
                batch_id = batch_id,
                "Batch already recorded; re-evaluating completion only"
            );
        }

        let (processed, items) = self.counted_batches(scan_id).await?;
        let expected = self
            .store
            .get_counter(&keys::scan_expected_total(scan_id))
            .await?
            .map(to_u64);

        debug!(
            scan_id = %scan_id,
            batch_id = batch_id,
            processed = processed,
            expected_total = ?expected,
            "Worker finished"
        );

        match expected {
            Some(expected) if processed >= expected => {
                let completion = ScanCompletion {
                    scan_id,
                    trigger: CompletionTrigger::WorkerFinished,
                    processed_batches: processed,
                    expected_batches: expected,
                    items,
                };
                self.try_finalize(completion).await
            }
            _ => Ok(CompletionOutcome::Pending {
                processed,
                expected_total: expected,
            }),
        }
    }

    /// Dispatch path: record the final total once, then check whether every
    /// batch already reported.
    pub async fn on_dispatch_finished(
        &self,
        scan_id: Uuid,
        expected_total: u64,
    ) -> Result<CompletionOutcome> {
        let stored_value = i64::try_from(expected_total).map_err(|_| {
            StoreError::InvalidArgument(format!(
                "expected total {expected_total} does not fit a store counter"
            ))
        })?;

        let key = keys::scan_expected_total(scan_id);
        let first = self.store.set_counter_if_absent(&key, stored_value).await?;

        let expected = if first {
            expected_total
        } else {
            orchestration_metrics::duplicate_completion_signals_total()
                .add(1, &[KeyValue::new("topic", "all_transmitted")]);
            let stored = self.store.get_counter(&key).await?.map(to_u64).unwrap_or(expected_total);
            if stored != expected_total {
                warn!(
                    scan_id = %scan_id,
                    stored_total = stored,
                    reported_total = expected_total,
                    "Conflicting dispatch totals; keeping the first"
                );
            }
            stored
        };

        let (processed, items) = self.counted_batches(scan_id).await?;

        debug!(
            scan_id = %scan_id,
            processed = processed,
            expected_total = expected,
            first_signal = first,
            "Dispatch finished"
        );

        if processed >= expected {
            let completion = ScanCompletion {
                scan_id,
                trigger: CompletionTrigger::DispatchFinished,
                processed_batches: processed,
                expected_batches: expected,
                items,
            };
            self.try_finalize(completion).await
        } else {
            Ok(CompletionOutcome::Pending {
                processed,
                expected_total: Some(expected),
            })
        }
    }

    pub async fn state(&self, scan_id: Uuid) -> Result<DualCompletionState> {
        let (processed_count, _) = self.counted_batches(scan_id).await?;
        Ok(DualCompletionState {
            processed_count,
            expected_total: self
                .store
                .get_counter(&keys::scan_expected_total(scan_id))
                .await?
                .map(to_u64),
            finalized: self
                .store
                .get_counter(&keys::scan_finalized(scan_id))
                .await?
                .is_some(),
        })
    }

    /// Drop all completion state for a scan (retention, tests)
    pub async fn clear(&self, scan_id: Uuid) -> Result<u64> {
        Ok(self.store.delete_prefix(&keys::scan(scan_id)).await?)
    }

    /// Item tallies summed over every batch recorded so far
    pub async fn item_totals(&self, scan_id: Uuid) -> Result<BatchTally> {
        Ok(self.counted_batches(scan_id).await?.1)
    }

    /// Distinct batches recorded for the scan and their summed tallies
    async fn counted_batches(&self, scan_id: Uuid) -> Result<(u64, BatchTally)> {
        let documents = self.store.list_documents(&keys::scan_batches(scan_id)).await?;

        let mut items = BatchTally::default();
        for document in &documents {
            let batch: BatchTally = serde_json::from_value(document.value.clone())?;
            items.processed = items.processed.saturating_add(batch.processed);
            items.failed = items.failed.saturating_add(batch.failed);
            items.flagged = items.flagged.saturating_add(batch.flagged);
        }
        Ok((documents.len() as u64, items))
    }

    async fn try_finalize(&self, completion: ScanCompletion) -> Result<CompletionOutcome> {
        let scan_id = completion.scan_id;
        let trigger = completion.trigger;
        let guard = keys::scan_finalized(scan_id);
        if !self.store.set_counter_if_absent(&guard, 1).await? {
            debug!(
                scan_id = %scan_id,
                trigger = trigger.as_str(),
                "Scan already finalized"
            );
            return Ok(CompletionOutcome::AlreadyFinalized);
        }

        if let Err(err) = self.finalizer.finalize(&completion).await {
            // give the guard back so a redelivered signal can finalize
            if let Err(store_err) = self.store.delete_prefix(&guard).await {
                warn!(
                    scan_id = %scan_id,
                    error = %store_err,
                    "Failed to clear finalize guard after finalizer error"
                );
            }
            return Err(err);
        }

        orchestration_metrics::scan_finalizations_total()
            .add(1, &[KeyValue::new("trigger", trigger.as_str())]);
        info!(
            scan_id = %scan_id,
            trigger = trigger.as_str(),
            processed_batches = completion.processed_batches,
            expected_batches = completion.expected_batches,
            "Scan finalized"
        );

        Ok(CompletionOutcome::Finalized(completion))
    }
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}
