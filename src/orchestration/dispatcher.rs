//! # Scan Dispatcher
//!
//! Fans a scan's items out to batch workers, then tells the orchestrator how
//! many batches to expect. The `all_transmitted` signal is sent only after the
//! last worker was spawned, so its count is final.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use super::batch_worker::{Batch, BatchWorker};
use crate::error::Result;
use crate::messaging::{AllTransmitted, BatchComplete, SignalClient};
use crate::models::JobMetadata;
use crate::processing::{ItemProcessor, WorkItem};

/// Spawned workers of one dispatch. Dropping it detaches the workers.
#[derive(Debug)]
pub struct Dispatched {
    pub batches: u64,
    pub items: u64,
    pub workers: Vec<JoinHandle<Result<BatchComplete>>>,
}

#[derive(Debug, Clone)]
pub struct ScanDispatcher {
    worker: Arc<BatchWorker>,
    signals: SignalClient,
    batch_size: usize,
}

impl ScanDispatcher {
    pub fn new(worker: Arc<BatchWorker>, signals: SignalClient, batch_size: usize) -> Self {
        Self {
            worker,
            signals,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn dispatch(
        &self,
        scan_id: Uuid,
        items: Vec<WorkItem>,
        processor: Arc<dyn ItemProcessor>,
        params: JobMetadata,
    ) -> Result<Dispatched> {
        let item_count = items.len() as u64;
        let batches = Batch::plan(scan_id, items, self.batch_size);
        let batch_count = batches.len() as u64;

        let workers = batches
            .into_iter()
            .map(|batch| {
                let worker = Arc::clone(&self.worker);
                let processor = Arc::clone(&processor);
                let params = params.clone();
                tokio::spawn(async move { worker.run(&batch, processor, &params).await })
            })
            .collect();

        self.signals
            .send(
                &scan_id.to_string(),
                &AllTransmitted {
                    scan_id,
                    expected_total: batch_count,
                },
            )
            .await?;

        info!(
            scan_id = %scan_id,
            batches = batch_count,
            items = item_count,
            "All batches transmitted"
        );

        Ok(Dispatched {
            batches: batch_count,
            items: item_count,
            workers,
        })
    }
}
