//! Exponential backoff policy
//!
//! Shared by the work queue (per-key requeue delays) and the watcher
//! (relist after a failed list call).

use std::time::Duration;

/// Default base delay, matching the controller-runtime item limiter.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);

/// Default ceiling for a single delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

/// Capped exponential backoff: `base * 2^(attempt - 1)`, never above `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    /// Create a policy. A ceiling below the base is raised to the base.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay for the given 1-based attempt. Attempt 0 is treated as 1.
    ///
    /// Saturates instead of overflowing, so very large attempt counts stay
    /// pinned at the ceiling.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}
