//! Backoff policy for permit release.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff with symmetric jitter.
///
/// The delay before retry `n` (1-based) is `min(base * 2^(n-1), max)` scaled
/// by `1 + j` with `j` drawn from `[-jitter_ratio, jitter_ratio]`, then capped
/// at `max`. `jitter_ratio` is clamped to `0.0..=1.0`, so the delay is never
/// negative.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReleaseRetryPolicy {
    /// Total release attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_ratio: f64,
}

impl ReleaseRetryPolicy {
    /// Delay to wait after failed attempt `attempt` (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let unit = fastrand::f64() * 2.0 - 1.0;
        self.delay_with_jitter(attempt, unit)
    }

    /// Deterministic form of [`delay_for_attempt`](Self::delay_for_attempt);
    /// `unit` is a jitter sample in `-1.0..=1.0`.
    pub fn delay_with_jitter(&self, attempt: u32, unit: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let raw = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        let ratio = if self.jitter_ratio.is_finite() {
            self.jitter_ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let factor = (1.0 + unit.clamp(-1.0, 1.0) * ratio).max(0.0);

        let nanos = (raw.as_nanos() as f64 * factor).round() as u64;
        Duration::from_nanos(nanos).min(self.max_delay)
    }

    /// Policy that retries without waiting
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_ratio: 0.0,
        }
    }
}

impl Default for ReleaseRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            jitter_ratio: 0.25,
        }
    }
}
