//! Full scans through the orchestrator on the in-memory backends.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use common::ScriptedProcessor;
use verity_core::completion::CompletionTrigger;
use verity_core::config::VerityConfig;
use verity_core::messaging::{InMemoryMailbox, SignalMailbox};
use verity_core::models::{Job, JobMetadata};
use verity_core::orchestration::{
    ItemSource, OrchestrationContext, ScanOrchestrator, ScanOutcome, StaticItemSource,
};
use verity_core::processing::{ItemOutcome, ItemProcessor, ProcessingError, ProcessorFactory};
use verity_core::services::StuckJobDetector;
use verity_core::state_machine::JobStatus;
use verity_core::store::{InMemoryStore, SharedStore};
use verity_core::VerityError;

struct Harness {
    orchestrator: ScanOrchestrator,
    mailbox: Arc<InMemoryMailbox>,
    config: VerityConfig,
}

fn harness(source: impl ItemSource + 'static, processor: Arc<dyn ItemProcessor>) -> Harness {
    common::init_tracing();
    let config = common::test_config();
    let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
    let mailbox = Arc::new(InMemoryMailbox::with_poll_interval(Duration::from_millis(5)));
    let context = OrchestrationContext::new(
        store,
        Arc::clone(&mailbox) as Arc<dyn SignalMailbox>,
        Arc::new(ProcessorFactory::single(processor)),
        Arc::new(source),
        &config,
    );
    Harness {
        orchestrator: ScanOrchestrator::new(&context, &config),
        mailbox,
        config,
    }
}

#[tokio::test]
async fn test_scan_completes_with_item_counts() {
    let processor = Arc::new(
        ScriptedProcessor::new()
            .script("item-2", vec![Err(ProcessingError::failed("item-2", "upstream 503"))])
            .script(
                "item-4",
                vec![
                    Ok(ItemOutcome::RetryNeeded {
                        reason: "content filter".to_string(),
                    }),
                    Ok(ItemOutcome::Processed { flagged: true }),
                ],
            )
            .script(
                "item-5",
                vec![Ok(ItemOutcome::Filtered {
                    reason: "unsupported language".to_string(),
                })],
            ),
    );
    let h = harness(StaticItemSource::numbered(7), processor.clone());

    let job = h
        .orchestrator
        .jobs()
        .create_job("claim_scan", None, JobMetadata::new().with("scope_id", "community-9"))
        .await
        .unwrap();
    assert!(!h.orchestrator.launch(job.id).await.unwrap().is_duplicate());
    assert!(h.orchestrator.launch(job.id).await.unwrap().is_duplicate());

    let report = h
        .orchestrator
        .run_next(Duration::from_secs(1))
        .await
        .unwrap()
        .expect("a queued workflow");

    assert_eq!(report.job_id, job.id);
    assert_eq!(report.final_status, JobStatus::Completed);
    // three batch_complete signals plus all_transmitted
    assert_eq!(report.signals_received, 4);
    let ScanOutcome::Finalized { items, .. } = report.outcome else {
        panic!("expected finalization, got {:?}", report.outcome);
    };
    assert_eq!((items.processed, items.failed, items.flagged), (5, 2, 1));
    assert_eq!(processor.calls(), 8);

    let done = h.orchestrator.jobs().get_job(job.id).await.unwrap();
    assert_eq!(done.total_tasks, Some(7));
    assert_eq!((done.completed_tasks, done.failed_tasks), (5, 2));
    assert!(done.started_at.is_some() && done.completed_at.is_some());

    // every signal and the workflow request were acked
    assert!(h.mailbox.is_empty());
    assert!(h
        .orchestrator
        .run_next(Duration::from_millis(20))
        .await
        .unwrap()
        .is_none());

    let err = h.orchestrator.launch(job.id).await.unwrap_err();
    assert!(matches!(err, VerityError::InvalidState(_)));
}

#[tokio::test]
async fn test_empty_scan_is_finalized_by_dispatch() {
    let h = harness(StaticItemSource::new(Vec::new()), Arc::new(ScriptedProcessor::new()));
    let job = h
        .orchestrator
        .jobs()
        .create_job("source_audit", None, JobMetadata::new())
        .await
        .unwrap();

    let report = h.orchestrator.run_scan(job.id).await.unwrap();
    assert!(matches!(
        report.outcome,
        ScanOutcome::Finalized {
            trigger: CompletionTrigger::DispatchFinished,
            ..
        }
    ));
    assert_eq!(report.final_status, JobStatus::Completed);

    let done = h.orchestrator.jobs().get_job(job.id).await.unwrap();
    assert_eq!(done.total_tasks, Some(0));
    assert_eq!((done.completed_tasks, done.failed_tasks), (0, 0));
}

#[tokio::test]
async fn test_dispatched_count_replaces_creation_estimate() {
    let h = harness(StaticItemSource::numbered(7), Arc::new(ScriptedProcessor::new()));
    let job = h
        .orchestrator
        .jobs()
        .create_job("claim_scan", Some(99), JobMetadata::new())
        .await
        .unwrap();
    h.orchestrator.launch(job.id).await.unwrap();

    let report = h
        .orchestrator
        .run_next(Duration::from_secs(1))
        .await
        .unwrap()
        .expect("a queued workflow");
    assert_eq!(report.final_status, JobStatus::Completed);

    let done = h.orchestrator.jobs().get_job(job.id).await.unwrap();
    assert_eq!(done.total_tasks, Some(7));
    assert_eq!(done.completed_tasks, 7);
    assert!(h.mailbox.is_empty());
}

struct UnreachableSource;

#[async_trait]
impl ItemSource for UnreachableSource {
    async fn items(&self, _job: &Job) -> verity_core::Result<Vec<verity_core::processing::WorkItem>> {
        Err(VerityError::ProcessingError("claims index unreachable".to_string()))
    }
}

#[tokio::test]
async fn test_setup_failure_fails_job_instead_of_leaving_it_running() {
    let h = harness(UnreachableSource, Arc::new(ScriptedProcessor::new()));
    let job = h
        .orchestrator
        .jobs()
        .create_job("claim_scan", None, JobMetadata::new())
        .await
        .unwrap();
    h.orchestrator.launch(job.id).await.unwrap();

    let report = h
        .orchestrator
        .run_next(Duration::from_secs(1))
        .await
        .unwrap()
        .expect("a queued workflow");
    assert_eq!(report.outcome, ScanOutcome::JobTerminal);
    assert_eq!(report.final_status, JobStatus::Failed);

    let failed = h.orchestrator.jobs().get_job(job.id).await.unwrap();
    assert_eq!(failed.error_summary.map(|summary| summary.code), Some("item_source_failed".to_string()));
    assert!(h.mailbox.is_empty());
}

#[tokio::test]
async fn test_concurrent_scans_share_store_and_mailbox() {
    let processor = Arc::new(ScriptedProcessor::new().with_delay(Duration::from_millis(2)));
    let h = harness(StaticItemSource::numbered(10), processor);
    let jobs = h.orchestrator.jobs();

    let a = jobs.create_job("claim_scan", None, JobMetadata::new()).await.unwrap();
    let b = jobs.create_job("claim_scan", None, JobMetadata::new()).await.unwrap();

    let (ra, rb) = tokio::join!(h.orchestrator.run_scan(a.id), h.orchestrator.run_scan(b.id));
    for report in [ra.unwrap(), rb.unwrap()] {
        assert_eq!(report.final_status, JobStatus::Completed);
        let ScanOutcome::Finalized { items, .. } = report.outcome else {
            panic!("expected finalization, got {:?}", report.outcome);
        };
        assert_eq!(items.processed, 10);

        let job = jobs.get_job(report.job_id).await.unwrap();
        assert_eq!(job.completed_tasks, 10);
    }
}

#[tokio::test]
async fn test_cancelled_job_is_skipped_and_request_acked() {
    let h = harness(StaticItemSource::numbered(3), Arc::new(ScriptedProcessor::new()));
    let job = h
        .orchestrator
        .jobs()
        .create_job("claim_scan", None, JobMetadata::new())
        .await
        .unwrap();

    h.orchestrator.launch(job.id).await.unwrap();
    h.orchestrator.jobs().cancel_job(job.id).await.unwrap();

    let report = h
        .orchestrator
        .run_next(Duration::from_secs(1))
        .await
        .unwrap()
        .expect("a queued workflow");
    assert_eq!(report.outcome, ScanOutcome::JobTerminal);
    assert_eq!(report.final_status, JobStatus::Cancelled);
    assert!(h.mailbox.is_empty());
}

#[tokio::test]
async fn test_cancel_during_scan_keeps_job_cancelled() {
    let processor = Arc::new(ScriptedProcessor::new().with_delay(Duration::from_millis(30)));
    let h = Arc::new(harness(StaticItemSource::numbered(6), processor));
    let job = h
        .orchestrator
        .jobs()
        .create_job("claim_scan", None, JobMetadata::new())
        .await
        .unwrap();

    let running = {
        let h = Arc::clone(&h);
        tokio::spawn(async move { h.orchestrator.run_scan(job.id).await })
    };

    while h.orchestrator.jobs().get_job(job.id).await.unwrap().status != JobStatus::InProgress {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    h.orchestrator.jobs().cancel_job(job.id).await.unwrap();

    let report = running.await.unwrap().unwrap();
    assert!(matches!(
        report.outcome,
        ScanOutcome::Finalized { .. } | ScanOutcome::JobTerminal
    ));
    assert_eq!(report.final_status, JobStatus::Cancelled);
    assert_eq!(
        h.orchestrator.jobs().get_job(job.id).await.unwrap().status,
        JobStatus::Cancelled
    );
}

#[tokio::test(start_paused = true)]
async fn test_silent_workers_leave_job_to_stuck_detector() {
    // workers never report within the receive budget
    let processor = Arc::new(ScriptedProcessor::new().with_delay(Duration::from_secs(3_600)));
    let h = harness(StaticItemSource::numbered(4), processor);
    let job = h
        .orchestrator
        .jobs()
        .create_job("claim_scan", None, JobMetadata::new())
        .await
        .unwrap();

    let report = h.orchestrator.run_scan(job.id).await.unwrap();
    assert_eq!(
        report.outcome,
        ScanOutcome::Abandoned {
            processed: 0,
            expected_total: Some(2),
        }
    );
    assert_eq!(report.final_status, JobStatus::InProgress);

    let detector = StuckJobDetector::new(h.orchestrator.jobs().clone(), &h.config.stuck_detection);
    assert!(detector.find_stuck(Utc::now()).await.unwrap().is_empty());

    let later = Utc::now() + chrono::Duration::hours(1);
    let stuck = detector.find_stuck(later).await.unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].job_id, job.id);
    assert_eq!(stuck[0].total_tasks, Some(4));
}
