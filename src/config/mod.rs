//! # Verity Configuration System
//!
//! Layered, validated configuration for the orchestration core. Every
//! component receives its section through its constructor; nothing reads
//! ambient process state after startup.
//!
//! ## Layers (later wins)
//!
//! 1. Built-in defaults (`#[serde(default)]` on every section)
//! 2. `config/verity.toml`
//! 3. `config/verity.{environment}.toml`
//! 4. `VERITY__SECTION__KEY` environment variables
//!
//! ## Usage
//!
//! ```rust,no_run
//! use verity_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let batch_size = manager.config().orchestration.batch_size;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rate_limit::ReleaseRetryPolicy;
use crate::resilience::CircuitBreakerConfig;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure mirroring `config/verity.toml`
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct VerityConfig {
    pub environment: String,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub circuit_breakers: CircuitBreakerSettings,
    pub rate_limiter: RateLimiterConfig,
    pub signaling: SignalingConfig,
    pub orchestration: OrchestrationConfig,
    pub stuck_detection: StuckDetectionConfig,
}

impl VerityConfig {
    /// Reject values that would make a component misbehave
    pub fn validate(&self) -> ConfigResult<()> {
        if self.database.max_connections == 0 {
            return Err(ConfigurationError::invalid_value(
                "database.max_connections",
                self.database.max_connections,
                "must be greater than 0",
            ));
        }

        self.circuit_breakers
            .default
            .to_resilience_config()
            .validate()
            .map_err(|e| {
                ConfigurationError::invalid_value(
                    "circuit_breakers.default",
                    format!("{:?}", self.circuit_breakers.default),
                    e,
                )
            })?;
        for (name, component) in &self.circuit_breakers.components {
            component.to_resilience_config().validate().map_err(|e| {
                ConfigurationError::invalid_value(
                    format!("circuit_breakers.components.{name}"),
                    format!("{component:?}"),
                    e,
                )
            })?;
        }

        self.rate_limiter.validate()?;

        if self.orchestration.batch_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "orchestration.batch_size",
                0,
                "must be greater than 0",
            ));
        }

        if self.stuck_detection.stall_threshold_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "stuck_detection.stall_threshold_seconds",
                0,
                "must be greater than 0",
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Postgres URL; the in-memory store is used when absent
    pub url: Option<String>,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Explicit filter directive; derived from the environment when absent
    pub level: Option<String>,
    /// Emit JSON records instead of human-readable lines
    pub json: bool,
}

/// Per-component breaker thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct BreakerComponentConfig {
    pub failure_threshold: u32,
    pub timeout_seconds: u64,
}

impl BreakerComponentConfig {
    pub fn to_resilience_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            reset_timeout: Duration::from_secs(self.timeout_seconds),
        }
    }
}

impl Default for BreakerComponentConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub enabled: bool,
    pub default: BreakerComponentConfig,
    pub components: HashMap<String, BreakerComponentConfig>,
}

impl CircuitBreakerSettings {
    /// Thresholds for a named component, falling back to the default
    pub fn config_for_component(&self, name: &str) -> CircuitBreakerConfig {
        self.components
            .get(name)
            .unwrap_or(&self.default)
            .to_resilience_config()
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default: BreakerComponentConfig::default(),
            components: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct ReleaseRetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ratio: f64,
}

impl ReleaseRetryConfig {
    pub fn to_policy(&self) -> ReleaseRetryPolicy {
        ReleaseRetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter_ratio: self.jitter_ratio,
        }
    }
}

impl Default for ReleaseRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
            jitter_ratio: 0.25,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// First wait between acquisition attempts while the permit is full
    pub poll_interval_ms: u64,
    /// Upper bound for the growing wait between attempts
    pub max_poll_interval_ms: u64,
    pub default_capacity: u32,
    pub default_max_wait_seconds: u64,
    /// TTL safety net for permits held by crashed workers
    pub default_expiry_seconds: u64,
    pub release_retry: ReleaseRetryConfig,
    /// Consecutive release failures before a critical alert
    pub alert_threshold: u64,
}

impl RateLimiterConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_millis(self.max_poll_interval_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.poll_interval_ms == 0 || self.max_poll_interval_ms < self.poll_interval_ms {
            return Err(ConfigurationError::invalid_value(
                "rate_limiter.poll_interval_ms",
                self.poll_interval_ms,
                "must be > 0 and not exceed max_poll_interval_ms",
            ));
        }
        if self.default_capacity == 0 {
            return Err(ConfigurationError::invalid_value(
                "rate_limiter.default_capacity",
                0,
                "must be greater than 0",
            ));
        }
        if self.release_retry.max_attempts == 0 {
            return Err(ConfigurationError::invalid_value(
                "rate_limiter.release_retry.max_attempts",
                0,
                "must be greater than 0",
            ));
        }
        if !(0.0..=1.0).contains(&self.release_retry.jitter_ratio) {
            return Err(ConfigurationError::invalid_value(
                "rate_limiter.release_retry.jitter_ratio",
                self.release_retry.jitter_ratio,
                "must be within 0.0..=1.0",
            ));
        }
        if self.alert_threshold == 0 {
            return Err(ConfigurationError::invalid_value(
                "rate_limiter.alert_threshold",
                0,
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            max_poll_interval_ms: 1_000,
            default_capacity: 4,
            default_max_wait_seconds: 30,
            default_expiry_seconds: 300,
            release_retry: ReleaseRetryConfig::default(),
            alert_threshold: crate::constants::DEFAULT_RELEASE_ALERT_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// How long a received signal stays invisible before redelivery
    pub visibility_timeout_seconds: u64,
    /// Poll interval for backends without push notification
    pub poll_interval_ms: u64,
}

impl SignalingConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_seconds: 30,
            poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestrationConfig {
    /// Items per batch worker
    pub batch_size: usize,
    /// Single receive wait inside the orchestrator loop
    pub signal_receive_timeout_seconds: u64,
    /// Consecutive empty receives before the orchestrator gives the job up to
    /// the stuck detector
    pub max_idle_receives: u32,
    /// Retries for items that come back as retry-needed
    pub max_filter_retries: u32,
    /// Breaker guarding the item processor dependency
    pub processor_breaker: String,
    /// Permit name template for per-item work
    pub permit_template: String,
}

impl OrchestrationConfig {
    pub fn signal_receive_timeout(&self) -> Duration {
        Duration::from_secs(self.signal_receive_timeout_seconds)
    }
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            batch_size: 25,
            signal_receive_timeout_seconds: 30,
            max_idle_receives: 20,
            max_filter_retries: 2,
            processor_breaker: "item_processor".to_string(),
            permit_template: "job_type:{job_type}".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StuckDetectionConfig {
    /// Zero progress for this long while non-terminal means stuck
    pub stall_threshold_seconds: u64,
}

impl StuckDetectionConfig {
    pub fn stall_threshold(&self) -> Duration {
        Duration::from_secs(self.stall_threshold_seconds)
    }
}

impl Default for StuckDetectionConfig {
    fn default() -> Self {
        Self {
            stall_threshold_seconds: 15 * 60,
        }
    }
}
