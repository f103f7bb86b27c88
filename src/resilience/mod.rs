//! # Resilience Module
//!
//! Circuit breakers that shed load from a flaky dependency once its failures
//! cross a threshold, and the registry that owns them.
//!
//! ## Usage
//!
//! ```rust
//! use verity_core::resilience::{CircuitBreakerConfig, CircuitBreakerRegistry};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = CircuitBreakerRegistry::new();
//! let breaker = registry.get_or_create("scorer", CircuitBreakerConfig::new(3, Duration::from_secs(30)));
//!
//! let score = breaker
//!     .call(|| async { Ok::<f64, std::io::Error>(0.87) })
//!     .await?;
//! # let _ = score;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod registry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerError, CircuitBreakerStatus, CircuitOpenError, CircuitState,
};
pub use config::CircuitBreakerConfig;
pub use registry::CircuitBreakerRegistry;
