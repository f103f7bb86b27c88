//! Release failure counting is shared by every middleware in the process.
//!
//! Kept in its own test binary: it observes process-wide counters.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::FlakyStore;
use verity_core::config::RateLimiterConfig;
use verity_core::models::JobMetadata;
use verity_core::rate_limit::{DistributedSemaphore, PermitPolicy, RateLimitMiddleware};
use verity_core::store::InMemoryStore;
use verity_core::VerityError;

fn limiter_config() -> RateLimiterConfig {
    let mut config = RateLimiterConfig {
        poll_interval_ms: 5,
        max_poll_interval_ms: 20,
        alert_threshold: 2,
        ..RateLimiterConfig::default()
    };
    config.release_retry.max_attempts = 1;
    config.release_retry.base_delay_ms = 1;
    config.release_retry.max_delay_ms = 1;
    config
}

#[tokio::test]
async fn test_success_on_one_middleware_resets_failures_from_another() {
    common::init_tracing();
    let config = limiter_config();
    let flaky = Arc::new(FlakyStore::new(0));

    let scoring = RateLimitMiddleware::from_config(
        Arc::new(DistributedSemaphore::new(Arc::new(InMemoryStore::new()), &config)),
        &config,
    );
    let publishing = RateLimitMiddleware::from_config(
        Arc::new(DistributedSemaphore::new(flaky.clone(), &config)),
        &config,
    );
    assert!(Arc::ptr_eq(scoring.metrics(), publishing.metrics()));

    let policy = PermitPolicy::new(
        "job_type:{job_type}",
        10,
        Duration::from_millis(200),
        Duration::from_secs(60),
    );
    let params = JobMetadata::new().with("job_type", "claim_scan");

    flaky.fail_next_releases(1);
    publishing
        .execute("scan-1:item-1", &policy, &params, || async { Ok::<_, VerityError>(()) })
        .await
        .unwrap();
    assert_eq!(scoring.metrics().snapshot().consecutive_release_failures, 1);

    // a clean release elsewhere in the process breaks the streak
    scoring
        .execute("scan-2:item-1", &policy, &params, || async { Ok::<_, VerityError>(()) })
        .await
        .unwrap();
    assert_eq!(publishing.metrics().snapshot().consecutive_release_failures, 0);

    flaky.fail_next_releases(1);
    publishing
        .execute("scan-1:item-2", &policy, &params, || async { Ok::<_, VerityError>(()) })
        .await
        .unwrap();
    let snapshot = publishing.metrics().snapshot();
    assert_eq!(snapshot.consecutive_release_failures, 1);
    assert_eq!(snapshot.release_failures, 2);
    assert_eq!(snapshot.alerts_raised, 0);
}
