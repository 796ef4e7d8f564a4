//! Prune rate limiting.

use std::time::Duration;

use tokio::time::Instant;

/// Skips prunes that come too soon after the last executed one.
///
/// A skipped attempt is dropped, not deferred. Time comes from
/// [`tokio::time::Instant`], so tests can drive it with a paused clock.
#[derive(Debug, Clone)]
pub struct PruneLimiter {
    interval: Duration,
    last: Option<Instant>,
}

impl PruneLimiter {
    /// A fresh limiter lets the first attempt through.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether a prune may run now. Elapsed time equal to the interval is enough.
    pub fn ready(&self) -> bool {
        self.last
            .is_none_or(|last| Instant::now().saturating_duration_since(last) >= self.interval)
    }

    /// Records a prune execution at the current instant.
    pub fn record(&mut self) {
        self.last = Some(Instant::now());
    }

    pub fn last_execution(&self) -> Option<Instant> {
        self.last
    }
}
