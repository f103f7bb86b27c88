//! # Distributed Rate Limiting
//!
//! Named, capacity-bounded permits shared across worker processes, and the
//! middleware that holds one permit per in-flight task.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use verity_core::config::RateLimiterConfig;
//! use verity_core::models::JobMetadata;
//! use verity_core::rate_limit::{DistributedSemaphore, PermitPolicy, RateLimitMiddleware};
//! use verity_core::store::InMemoryStore;
//! use verity_core::VerityError;
//!
//! # async fn example() -> Result<(), VerityError> {
//! let config = RateLimiterConfig::default();
//! let semaphore = Arc::new(DistributedSemaphore::new(Arc::new(InMemoryStore::new()), &config));
//! let middleware = RateLimitMiddleware::from_config(semaphore, &config);
//!
//! let policy = PermitPolicy::from_config("scope:{scope_id}", &config);
//! let params = JobMetadata::new().with("scope_id", "community-7");
//! let verdict = middleware
//!     .execute("item-42", &policy, &params, || async { Ok::<_, VerityError>("supported") })
//!     .await?;
//! # let _ = verdict;
//! # Ok(())
//! # }
//! ```

pub mod errors;
pub mod metrics;
pub mod middleware;
pub mod retry;
pub mod semaphore;
pub mod template;

pub use errors::{RateLimitError, RateLimitResult};
pub use metrics::{RateLimitMetrics, RateLimitMetricsSnapshot};
pub use middleware::{PermitPolicy, RateLimitMiddleware};
pub use retry::ReleaseRetryPolicy;
pub use semaphore::{DistributedSemaphore, Permit};
pub use template::{placeholders, resolve_permit_name};
