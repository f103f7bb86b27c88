//! # Circuit Breaker Registry
//!
//! Owns named circuit breakers for the lifetime of the process (or of the
//! registry, in tests). Breakers are created lazily on first use; the first
//! registration of a name fixes its configuration.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::{info, warn};

use super::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, CircuitState};
use crate::config::CircuitBreakerSettings;

static GLOBAL_REGISTRY: OnceLock<CircuitBreakerRegistry> = OnceLock::new();

/// Registry of circuit breakers keyed by component name
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    settings: CircuitBreakerSettings,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose [`breaker`](Self::breaker) lookups use configured thresholds
    pub fn from_settings(settings: CircuitBreakerSettings) -> Self {
        info!(
            enabled = settings.enabled,
            components = settings.components.len(),
            "Initializing circuit breaker registry"
        );
        Self {
            breakers: RwLock::new(HashMap::new()),
            settings,
        }
    }

    /// Process-wide registry.
    ///
    /// Initialized with `settings` on the first call; later calls ignore the
    /// argument. Components that need isolation (tests, embedded use) should
    /// own a registry instead.
    pub fn global(settings: Option<&CircuitBreakerSettings>) -> &'static CircuitBreakerRegistry {
        GLOBAL_REGISTRY.get_or_init(|| {
            Self::from_settings(settings.cloned().unwrap_or_default())
        })
    }

    /// Whether breakers should guard calls at all
    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Breaker for `name` using the configured thresholds for that component
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create(name, self.settings.config_for_component(name))
    }

    /// Idempotent per name. A differing configuration for an existing name is
    /// logged and ignored.
    pub fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        {
            let breakers = self.breakers.read();
            if let Some(breaker) = breakers.get(name) {
                Self::warn_on_mismatch(breaker, &config);
                return Arc::clone(breaker);
            }
        }

        let mut breakers = self.breakers.write();

        // another caller may have created it between the two locks
        if let Some(breaker) = breakers.get(name) {
            Self::warn_on_mismatch(breaker, &config);
            return Arc::clone(breaker);
        }

        let breaker = Arc::new(CircuitBreaker::new(name, config));
        breakers.insert(name.to_string(), Arc::clone(&breaker));

        info!(
            component = name,
            total_circuit_breakers = breakers.len(),
            "Created new circuit breaker"
        );

        breaker
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    pub fn status(&self, name: &str) -> Option<CircuitBreakerStatus> {
        self.breakers.read().get(name).map(|breaker| breaker.status())
    }

    /// Status of every breaker, ordered by name
    pub fn status_all(&self) -> Vec<CircuitBreakerStatus> {
        let mut statuses: Vec<_> = self
            .breakers
            .read()
            .values()
            .map(|breaker| breaker.status())
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Force one breaker CLOSED. Returns whether it exists.
    pub fn reset(&self, name: &str) -> bool {
        match self.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        let breakers: Vec<_> = self.breakers.read().values().cloned().collect();
        warn!(count = breakers.len(), "Resetting all circuit breakers");
        for breaker in breakers {
            breaker.reset();
        }
    }

    pub fn list_components(&self) -> Vec<String> {
        let mut names: Vec<_> = self.breakers.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Breakers that are not CLOSED
    pub fn unhealthy_components(&self) -> Vec<String> {
        self.status_all()
            .into_iter()
            .filter(|status| status.state != CircuitState::Closed)
            .map(|status| status.name)
            .collect()
    }

    fn warn_on_mismatch(existing: &CircuitBreaker, requested: &CircuitBreakerConfig) {
        if existing.config() != requested {
            warn!(
                component = existing.name(),
                existing_threshold = existing.config().failure_threshold,
                existing_timeout_secs = existing.config().reset_timeout.as_secs_f64(),
                requested_threshold = requested.failure_threshold,
                requested_timeout_secs = requested.reset_timeout.as_secs_f64(),
                "Circuit breaker already registered with a different configuration; keeping the original"
            );
        }
    }
}
