//! Bounded exponential backoff for registry pushes.

use std::time::Duration;

use crate::config::RegistryConfig;

/// How many times to try an operation and how long to wait in between.
///
/// The wait after failed attempt `n` (1-based) is `initial_backoff * 2^(n-1)`,
/// so the defaults sleep 2 s, 4 s and 8 s between four attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn from_registry(cfg: &RegistryConfig) -> Self {
        Self {
            max_attempts: cfg.push_attempts.max(1),
            initial_backoff: cfg.push_initial_backoff(),
        }
    }

    /// Delay before the attempt following failed attempt `attempt`.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(1u32 << exp)
    }

    pub fn is_last(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}
