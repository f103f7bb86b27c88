//! Property tests for the job lifecycle and completion race.

mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use proptest::prelude::*;
use uuid::Uuid;

use common::RecordingFinalizer;
use verity_core::completion::{BatchTally, CompletionOutcome, DualCompletionCoordinator};
use verity_core::models::{Job, JobMetadata};
use verity_core::state_machine::{JobStateMachine, JobStatus};
use verity_core::store::InMemoryStore;

fn any_status() -> impl Strategy<Value = JobStatus> {
    prop::sample::select(JobStatus::ALL.to_vec())
}

#[derive(Debug, Clone)]
enum Signal {
    Batch(u64),
    AllTransmitted,
}

/// Every batch once, the dispatch total somewhere among them, and a few
/// redeliveries at the end
fn completion_schedule() -> impl Strategy<Value = (u64, Vec<Signal>)> {
    (1u64..8).prop_flat_map(|batches| {
        (
            Just((0..batches).collect::<Vec<_>>()).prop_shuffle(),
            0..=batches as usize,
            prop::collection::vec(0..batches, 0..3),
        )
            .prop_map(move |(order, dispatch_at, redelivered)| {
                let mut signals: Vec<Signal> = order.into_iter().map(Signal::Batch).collect();
                signals.insert(dispatch_at, Signal::AllTransmitted);
                signals.extend(redelivered.into_iter().map(Signal::Batch));
                (batches, signals)
            })
    })
}

proptest! {
    #[test]
    fn transitions_follow_the_table(targets in prop::collection::vec(any_status(), 1..12)) {
        let mut job = Job::new("claim_scan", None, JobMetadata::new());
        let mut now = Utc::now();
        let mut started_at = None;
        let mut completed_at = None;

        for target in targets {
            now += Duration::seconds(1);
            let before = job.status;
            match JobStateMachine::transition(&job, target, now) {
                Ok(next) => {
                    prop_assert!(JobStateMachine::can_transition(before, target));
                    prop_assert_eq!(next.status, target);
                    job = next;
                }
                Err(_) => {
                    prop_assert!(!JobStateMachine::can_transition(before, target));
                    prop_assert_eq!(job.status, before);
                }
            }

            // once-only timestamps
            if let Some(previous) = started_at {
                prop_assert_eq!(job.started_at, Some(previous));
            }
            if let Some(previous) = completed_at {
                prop_assert_eq!(job.completed_at, Some(previous));
            }
            started_at = job.started_at;
            completed_at = job.completed_at;

            prop_assert_eq!(job.completed_at.is_some(), job.status.is_terminal());
            if job.status == JobStatus::InProgress {
                prop_assert!(job.started_at.is_some());
            }
        }
    }

    #[test]
    fn any_signal_order_finalizes_exactly_once((batches, signals) in completion_schedule()) {
        let finalizer = RecordingFinalizer::new();
        let coordinator = DualCompletionCoordinator::new(
            Arc::new(InMemoryStore::new()),
            finalizer.clone(),
        );
        let scan = Uuid::new_v4();

        let finalized = tokio_test::block_on(async {
            let mut finalized = 0;
            for signal in &signals {
                let outcome = match signal {
                    Signal::Batch(batch) => coordinator
                        .on_worker_finished(scan, *batch, BatchTally { processed: 2, failed: 1, flagged: 0 })
                        .await,
                    Signal::AllTransmitted => coordinator.on_dispatch_finished(scan, batches).await,
                }
                .unwrap();
                if let CompletionOutcome::Finalized(completion) = outcome {
                    assert_eq!(completion.processed_batches, batches);
                    finalized += 1;
                }
            }
            finalized
        });

        prop_assert_eq!(finalized, 1);
        prop_assert_eq!(finalizer.count_for(scan), 1);
        let completion = &finalizer.calls()[0];
        prop_assert_eq!(completion.items.processed, 2 * batches);
        prop_assert_eq!(completion.items.failed, batches);
    }
}
