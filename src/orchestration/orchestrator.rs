//! # Scan Orchestrator
//!
//! Runs one scan workflow end to end: claims the launch request, starts the
//! job, hands items to the dispatcher, then feeds every `batch_complete` and
//! `all_transmitted` signal into the [`DualCompletionCoordinator`] until the
//! scan is finalized. Signals are acked only after the coordinator has
//! processed them, so a crash in between leads to redelivery, never loss.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::batch_worker::BatchWorker;
use super::dispatcher::{Dispatched, ScanDispatcher};
use super::finalizer::JobFinalizer;
use super::source::ItemSource;
use crate::completion::{BatchTally, CompletionOutcome, CompletionTrigger, DualCompletionCoordinator};
use crate::config::{OrchestrationConfig, VerityConfig};
use crate::error::{Result, VerityError};
use crate::logging::log_error;
use crate::messaging::{EnqueueOutcome, MessageId, ScanSignal, SignalClient, SignalMailbox};
use crate::models::{ErrorSummary, JobMetadata};
use crate::processing::ProcessorFactory;
use crate::rate_limit::{DistributedSemaphore, PermitPolicy, RateLimitMiddleware};
use crate::resilience::CircuitBreakerRegistry;
use crate::services::BatchJobService;
use crate::state_machine::JobStatus;
use crate::store::SharedStore;

/// Collaborators an orchestrator is built from
#[derive(Clone)]
pub struct OrchestrationContext {
    pub store: Arc<dyn SharedStore>,
    pub mailbox: Arc<dyn SignalMailbox>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub middleware: Arc<RateLimitMiddleware>,
    pub processors: Arc<ProcessorFactory>,
    pub source: Arc<dyn ItemSource>,
}

impl std::fmt::Debug for OrchestrationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestrationContext")
            .field("breakers", &self.breakers)
            .field("middleware", &self.middleware)
            .finish_non_exhaustive()
    }
}

impl OrchestrationContext {
    /// Breaker registry and rate-limit middleware built from `config`
    pub fn new(
        store: Arc<dyn SharedStore>,
        mailbox: Arc<dyn SignalMailbox>,
        processors: Arc<ProcessorFactory>,
        source: Arc<dyn ItemSource>,
        config: &VerityConfig,
    ) -> Self {
        let semaphore = Arc::new(DistributedSemaphore::new(Arc::clone(&store), &config.rate_limiter));
        Self {
            store,
            mailbox,
            breakers: Arc::new(CircuitBreakerRegistry::from_settings(
                config.circuit_breakers.clone(),
            )),
            middleware: Arc::new(RateLimitMiddleware::from_config(semaphore, &config.rate_limiter)),
            processors,
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScanOutcome {
    /// This run triggered finalization
    Finalized { trigger: CompletionTrigger, items: BatchTally },
    /// A previous delivery already finalized the scan
    AlreadyFinalized,
    /// The job was (or became) terminal without this run finalizing it
    JobTerminal,
    /// Receive budget exhausted; the job stays IN_PROGRESS for the stuck detector
    Abandoned {
        processed: u64,
        expected_total: Option<u64>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    pub job_id: Uuid,
    pub outcome: ScanOutcome,
    pub final_status: JobStatus,
    pub signals_received: u64,
}

pub struct ScanOrchestrator {
    jobs: BatchJobService,
    signals: SignalClient,
    coordinator: Arc<DualCompletionCoordinator>,
    dispatcher: ScanDispatcher,
    processors: Arc<ProcessorFactory>,
    source: Arc<dyn ItemSource>,
    config: OrchestrationConfig,
}

impl std::fmt::Debug for ScanOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanOrchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ScanOrchestrator {
    pub fn new(context: &OrchestrationContext, config: &VerityConfig) -> Self {
        let jobs = BatchJobService::new(Arc::clone(&context.store));
        let signals = SignalClient::new(Arc::clone(&context.mailbox), &config.signaling);
        let coordinator = Arc::new(DualCompletionCoordinator::new(
            Arc::clone(&context.store),
            Arc::new(JobFinalizer::new(jobs.clone())),
        ));

        let breaker = context
            .breakers
            .is_enabled()
            .then(|| context.breakers.breaker(&config.orchestration.processor_breaker));
        let worker = Arc::new(BatchWorker::new(
            Arc::clone(&context.middleware),
            breaker,
            signals.clone(),
            PermitPolicy::from_config(
                config.orchestration.permit_template.clone(),
                &config.rate_limiter,
            ),
            config.orchestration.max_filter_retries,
        ));

        Self {
            jobs,
            signals: signals.clone(),
            coordinator,
            dispatcher: ScanDispatcher::new(worker, signals, config.orchestration.batch_size),
            processors: Arc::clone(&context.processors),
            source: Arc::clone(&context.source),
            config: config.orchestration.clone(),
        }
    }

    pub fn jobs(&self) -> &BatchJobService {
        &self.jobs
    }

    pub fn coordinator(&self) -> &Arc<DualCompletionCoordinator> {
        &self.coordinator
    }

    pub fn signals(&self) -> &SignalClient {
        &self.signals
    }

    /// Queue the scan workflow for `job_id`. Launching a job whose workflow
    /// is already queued or running returns [`EnqueueOutcome::Duplicate`].
    pub async fn launch(&self, job_id: Uuid) -> Result<EnqueueOutcome> {
        let job = self.jobs.get_job(job_id).await?;
        if job.is_terminal() {
            return Err(VerityError::InvalidState(format!(
                "job {job_id} is {} and cannot be launched",
                job.status
            )));
        }

        let outcome = self.signals.enqueue_workflow(job_id).await?;
        if outcome.is_duplicate() {
            debug!(job_id = %job_id, "Scan workflow already queued or running");
        }
        Ok(outcome)
    }

    /// Claim the next queued workflow and run it. `Ok(None)` when nothing was
    /// queued within `timeout`.
    pub async fn run_next(&self, timeout: Duration) -> Result<Option<ScanReport>> {
        let Some(request) = self.signals.claim_workflow(timeout).await? else {
            return Ok(None);
        };
        let job_id = request.signal.job_id;

        match self.run(job_id, Some(request.message_id)).await {
            Ok(report) => {
                self.signals.ack(request.message_id).await?;
                Ok(Some(report))
            }
            Err(err) => {
                log_error(
                    "scan_orchestrator",
                    "run_next",
                    &err.to_string(),
                    Some(&format!("job_id={job_id} retryable={}", err.is_retryable())),
                );
                if err.is_retryable() {
                    self.signals.release(request.message_id).await?;
                } else {
                    self.signals.ack(request.message_id).await?;
                }
                Err(err)
            }
        }
    }

    /// Run the scan for `job_id` directly, without a queued request
    pub async fn run_scan(&self, job_id: Uuid) -> Result<ScanReport> {
        self.run(job_id, None).await
    }

    async fn run(&self, job_id: Uuid, lease: Option<MessageId>) -> Result<ScanReport> {
        let job = self.jobs.get_job(job_id).await?;
        if job.is_terminal() {
            info!(job_id = %job_id, status = %job.status, "Job already terminal; skipping scan");
            return Ok(ScanReport {
                job_id,
                outcome: ScanOutcome::JobTerminal,
                final_status: job.status,
                signals_received: 0,
            });
        }

        let job = self.jobs.start_job(job_id).await?;

        let items = match self.source.items(&job).await {
            Ok(items) => items,
            Err(err) => return self.abandon_setup(job_id, "item_source_failed", &err).await,
        };
        if let Err(err) = self.jobs.set_total_tasks(job_id, items.len() as u64).await {
            if err.is_retryable() {
                return Err(err);
            }
            return self.abandon_setup(job_id, "scan_setup_failed", &err).await;
        }

        let processor = self.processors.for_job(&job.metadata).await;
        let params = worker_params(&job.job_type, job_id, &job.metadata);

        info!(
            job_id = %job_id,
            job_type = %job.job_type,
            items = items.len(),
            processor = processor.name(),
            "Scan started"
        );

        let dispatcher = self.dispatcher.clone();
        let dispatch = tokio::spawn(async move {
            dispatcher.dispatch(job_id, items, processor, params).await
        });

        self.receive_until_done(job_id, lease, dispatch).await
    }

    /// Fail a started job whose scan could not be set up
    async fn abandon_setup(
        &self,
        job_id: Uuid,
        code: &str,
        err: &VerityError,
    ) -> Result<ScanReport> {
        error!(job_id = %job_id, code = code, error = %err, "Scan setup failed");
        let failed = self
            .jobs
            .fail_job(job_id, ErrorSummary::new(code, err.to_string()))
            .await?;
        Ok(ScanReport {
            job_id,
            outcome: ScanOutcome::JobTerminal,
            final_status: failed.status,
            signals_received: 0,
        })
    }

    async fn receive_until_done(
        &self,
        job_id: Uuid,
        lease: Option<MessageId>,
        dispatch: JoinHandle<Result<Dispatched>>,
    ) -> Result<ScanReport> {
        let receive_timeout = self.config.signal_receive_timeout();
        let mut dispatch = Some(dispatch);
        let mut workers = Vec::new();
        let mut idle = 0u32;
        let mut received = 0u64;

        let outcome = loop {
            if let Some(lease) = lease {
                if let Err(err) = self.signals.extend(lease).await {
                    warn!(job_id = %job_id, error = %err, "Failed to extend workflow claim");
                }
            }

            if dispatch.as_ref().is_some_and(JoinHandle::is_finished) {
                if let Some(handle) = dispatch.take() {
                    match harvest(handle).await {
                        Ok(dispatched) => workers = dispatched.workers,
                        Err(err) => {
                            error!(job_id = %job_id, error = %err, "Dispatch failed");
                            self.jobs
                                .fail_job(job_id, ErrorSummary::new("dispatch_failed", err.to_string()))
                                .await?;
                            break ScanOutcome::JobTerminal;
                        }
                    }
                }
            }

            let message = match self.signals.receive_scan_signal(job_id, receive_timeout).await {
                Ok(message) => message,
                Err(err) => {
                    warn!(job_id = %job_id, error = %err, "Signal receive failed");
                    None
                }
            };

            let Some(message) = message else {
                idle += 1;
                if self.jobs.get_job(job_id).await?.is_terminal() {
                    break ScanOutcome::JobTerminal;
                }
                if idle >= self.config.max_idle_receives {
                    let state = self.coordinator.state(job_id).await?;
                    warn!(
                        job_id = %job_id,
                        idle_receives = idle,
                        processed = state.processed_count,
                        expected_total = ?state.expected_total,
                        "No completion signals; leaving scan to the stuck detector"
                    );
                    break ScanOutcome::Abandoned {
                        processed: state.processed_count,
                        expected_total: state.expected_total,
                    };
                }
                continue;
            };

            received += 1;
            match self.apply(job_id, message.signal).await {
                Ok(outcome) => {
                    self.signals.ack(message.message_id).await?;
                    idle = 0;
                    match outcome {
                        CompletionOutcome::Finalized(completion) => {
                            break ScanOutcome::Finalized {
                                trigger: completion.trigger,
                                items: completion.items,
                            }
                        }
                        CompletionOutcome::AlreadyFinalized => break ScanOutcome::AlreadyFinalized,
                        CompletionOutcome::Pending { .. } => {}
                    }
                }
                Err(err) => {
                    // redelivered on the next receive
                    warn!(
                        job_id = %job_id,
                        message_id = message.message_id,
                        error = %err,
                        "Completion signal not applied; releasing"
                    );
                    self.signals.release(message.message_id).await?;
                    idle += 1;
                    if idle >= self.config.max_idle_receives {
                        return Err(err);
                    }
                }
            }
        };

        if matches!(
            outcome,
            ScanOutcome::Finalized { .. } | ScanOutcome::AlreadyFinalized
        ) {
            if let Some(handle) = dispatch.take() {
                if let Ok(dispatched) = harvest(handle).await {
                    workers = dispatched.workers;
                }
            }
            for result in join_all(workers).await {
                match result {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => warn!(job_id = %job_id, error = %err, "Batch worker ended with error"),
                    Err(err) => warn!(job_id = %job_id, error = %err, "Batch worker panicked"),
                }
            }
        }

        let final_status = self.jobs.get_job(job_id).await?.status;
        info!(
            job_id = %job_id,
            outcome = ?outcome,
            final_status = %final_status,
            signals_received = received,
            "Scan run finished"
        );

        Ok(ScanReport {
            job_id,
            outcome,
            final_status,
            signals_received: received,
        })
    }

    async fn apply(&self, job_id: Uuid, signal: ScanSignal) -> Result<CompletionOutcome> {
        if signal.scan_id() != job_id {
            warn!(job_id = %job_id, scan_id = %signal.scan_id(), "Signal addressed to another scan; dropping");
            return Ok(CompletionOutcome::Pending {
                processed: 0,
                expected_total: None,
            });
        }

        match signal {
            ScanSignal::BatchComplete(batch) => {
                let outcome = self
                    .coordinator
                    .on_worker_finished(
                        job_id,
                        batch.batch_id,
                        BatchTally {
                            processed: batch.processed,
                            failed: batch.failed,
                            flagged: batch.flagged,
                        },
                    )
                    .await?;
                if !outcome.is_finalized() {
                    self.record_progress(job_id).await;
                }
                Ok(outcome)
            }
            ScanSignal::AllTransmitted(all) => {
                self.coordinator
                    .on_dispatch_finished(job_id, all.expected_total)
                    .await
            }
        }
    }

    async fn record_progress(&self, job_id: Uuid) {
        if let Err(err) = self.try_record_progress(job_id).await {
            debug!(job_id = %job_id, error = %err, "Progress update skipped");
        }
    }

    async fn try_record_progress(&self, job_id: Uuid) -> Result<()> {
        let totals = self.coordinator.item_totals(job_id).await?;
        self.jobs
            .update_progress(job_id, totals.processed, totals.failed)
            .await?;
        Ok(())
    }
}

async fn harvest(handle: JoinHandle<Result<Dispatched>>) -> Result<Dispatched> {
    handle
        .await
        .map_err(|e| VerityError::OrchestrationError(format!("dispatcher task failed: {e}")))?
}

/// Permit template parameters: the job's metadata plus its identity
fn worker_params(job_type: &str, job_id: Uuid, metadata: &JobMetadata) -> JobMetadata {
    let mut params = metadata.clone();
    if params.get("job_type").is_none() {
        params.insert("job_type", job_type);
    }
    if params.get("scan_id").is_none() {
        params.insert("scan_id", job_id.to_string());
    }
    params
}
