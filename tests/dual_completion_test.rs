//! Exactly-once finalization when workers and the dispatcher race.

mod common;

use std::sync::Arc;

use uuid::Uuid;

use common::RecordingFinalizer;
use verity_core::completion::{
    BatchTally, CompletionOutcome, CompletionTrigger, DualCompletionCoordinator,
};
use verity_core::store::{InMemoryStore, SharedStore};

fn coordinator(finalizer: Arc<RecordingFinalizer>) -> Arc<DualCompletionCoordinator> {
    let store: Arc<dyn SharedStore> = Arc::new(InMemoryStore::new());
    Arc::new(DualCompletionCoordinator::new(store, finalizer))
}

fn tally(processed: u64, failed: u64) -> BatchTally {
    BatchTally {
        processed,
        failed,
        flagged: 0,
    }
}

#[tokio::test]
async fn test_workers_finish_before_dispatch() {
    common::init_tracing();
    let finalizer = RecordingFinalizer::new();
    let coordinator = coordinator(finalizer.clone());
    let scan = Uuid::new_v4();

    for batch in 0..5 {
        let outcome = coordinator
            .on_worker_finished(scan, batch, tally(2, 0))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            CompletionOutcome::Pending {
                expected_total: None,
                ..
            }
        ));
    }
    assert_eq!(finalizer.count_for(scan), 0);

    let outcome = coordinator.on_dispatch_finished(scan, 5).await.unwrap();
    let CompletionOutcome::Finalized(completion) = outcome else {
        panic!("dispatch should finalize, got {outcome:?}");
    };
    assert_eq!(completion.trigger, CompletionTrigger::DispatchFinished);
    assert_eq!(completion.items.processed, 10);
    assert_eq!(finalizer.count_for(scan), 1);

    // a redelivered total does not finalize again
    assert_eq!(
        coordinator.on_dispatch_finished(scan, 5).await.unwrap(),
        CompletionOutcome::AlreadyFinalized
    );
    assert_eq!(finalizer.count_for(scan), 1);
}

#[tokio::test]
async fn test_dispatch_before_last_worker() {
    let finalizer = RecordingFinalizer::new();
    let coordinator = coordinator(finalizer.clone());
    let scan = Uuid::new_v4();

    for batch in 0..4 {
        coordinator.on_worker_finished(scan, batch, tally(1, 1)).await.unwrap();
    }
    let outcome = coordinator.on_dispatch_finished(scan, 5).await.unwrap();
    assert_eq!(
        outcome,
        CompletionOutcome::Pending {
            processed: 4,
            expected_total: Some(5)
        }
    );

    let last = coordinator.on_worker_finished(scan, 4, tally(1, 1)).await.unwrap();
    let CompletionOutcome::Finalized(completion) = last else {
        panic!("last worker should finalize, got {last:?}");
    };
    assert_eq!(completion.trigger, CompletionTrigger::WorkerFinished);
    assert_eq!((completion.processed_batches, completion.expected_batches), (5, 5));
    assert_eq!(completion.items, tally(5, 5));
    assert_eq!(finalizer.count_for(scan), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_race_finalizes_exactly_once() {
    for _ in 0..20 {
        let finalizer = RecordingFinalizer::new();
        let coordinator = coordinator(finalizer.clone());
        let scan = Uuid::new_v4();
        let batches = 8u64;

        let mut handles = Vec::new();
        for batch in 0..batches {
            let coordinator = Arc::clone(&coordinator);
            handles.push(tokio::spawn(async move {
                coordinator.on_worker_finished(scan, batch, tally(3, 0)).await
            }));
        }
        {
            let coordinator = Arc::clone(&coordinator);
            handles.push(tokio::spawn(async move {
                coordinator.on_dispatch_finished(scan, batches).await
            }));
        }
        // a redelivered batch signal racing the rest
        {
            let coordinator = Arc::clone(&coordinator);
            handles.push(tokio::spawn(async move {
                coordinator.on_worker_finished(scan, 0, tally(3, 0)).await
            }));
        }

        let mut finalized = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_finalized() {
                finalized += 1;
            }
        }

        assert_eq!(finalized, 1);
        assert_eq!(finalizer.count_for(scan), 1);
        let completion = &finalizer.calls()[0];
        assert_eq!(completion.items.processed, 24);

        let state = coordinator.state(scan).await.unwrap();
        assert_eq!(state.processed_count, batches);
        assert!(state.finalized);
    }
}

#[tokio::test]
async fn test_scans_sharing_a_store_do_not_interfere() {
    let finalizer = RecordingFinalizer::new();
    let coordinator = coordinator(finalizer.clone());
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

    coordinator.on_dispatch_finished(a, 2).await.unwrap();
    coordinator.on_dispatch_finished(b, 1).await.unwrap();
    coordinator.on_worker_finished(a, 0, tally(1, 0)).await.unwrap();

    // batch 0 of scan b finishes scan b only
    assert!(coordinator
        .on_worker_finished(b, 0, tally(1, 0))
        .await
        .unwrap()
        .is_finalized());
    assert_eq!(finalizer.count_for(a), 0);
    assert_eq!(finalizer.count_for(b), 1);

    assert!(coordinator
        .on_worker_finished(a, 1, tally(1, 0))
        .await
        .unwrap()
        .is_finalized());
    assert_eq!(finalizer.count_for(a), 1);
}
