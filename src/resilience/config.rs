//! # Circuit Breaker Configuration
//!
//! Thresholds for a single breaker. System-wide settings (per-component
//! overrides, enable flag) live in [`crate::config::CircuitBreakerSettings`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a single circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Time spent OPEN before a probe is allowed
    pub reset_timeout: Duration,
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            reset_timeout,
        }
    }

    /// Configuration for the opaque item processor (model calls, scorers)
    pub fn for_item_processor() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }

    /// Configuration for the shared store
    pub fn for_store() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(15),
        }
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be greater than 0".to_string());
        }

        if self.failure_threshold > 100 {
            return Err("failure_threshold should not exceed 100".to_string());
        }

        if self.reset_timeout.is_zero() {
            return Err("reset_timeout must be greater than 0".to_string());
        }

        if self.reset_timeout > Duration::from_secs(3600) {
            return Err("reset_timeout should not exceed 3600 seconds".to_string());
        }

        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}
