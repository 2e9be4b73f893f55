//! Delay policy between automatic restart attempts.

use std::time::Duration;

use plexus_kernel::utils::millis;
use serde::{Deserialize, Serialize};

/// How the delay grows between consecutive restart attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every attempt.
    Fixed,
    /// Delay increases linearly: `base * (attempt + 1)`.
    Linear,
    /// Delay doubles per attempt: `base * 2^attempt`.
    #[default]
    Exponential,
}

impl BackoffStrategy {
    /// Sleep before the given restart attempt (0-indexed), never above `max`.
    pub fn delay_for(&self, attempt: u32, base: Duration, max: Duration) -> Duration {
        let base_ms = millis(base);
        let max_ms = millis(max);
        let ms = match self {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Linear => base_ms.saturating_mul(u64::from(attempt) + 1),
            BackoffStrategy::Exponential => 1u64
                .checked_shl(attempt)
                .and_then(|factor| base_ms.checked_mul(factor))
                .unwrap_or(max_ms),
        };
        Duration::from_millis(ms.min(max_ms))
    }
}
