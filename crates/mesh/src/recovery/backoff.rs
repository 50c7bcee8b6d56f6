//! Retry backoff schedule.

use std::time::Duration;

use rand::Rng;

/// Explicit backoff sequence with optional jitter.
///
/// Retry `n` (1-based) waits `delays[n - 1]`; retries past the end of the
/// sequence reuse its last delay.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffSchedule {
    delays_ms: Vec<u64>,
    jitter_factor: f64,
}

impl BackoffSchedule {
    /// Create a schedule from millisecond delays.
    #[must_use]
    pub fn new(delays_ms: Vec<u64>) -> Self {
        Self {
            delays_ms,
            jitter_factor: 0.0,
        }
    }

    /// Add up to `factor` times the delay of random jitter.
    #[must_use]
    pub const fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor;
        self
    }

    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let index = usize::try_from(retry.saturating_sub(1)).unwrap_or(usize::MAX);
        let base = self
            .delays_ms
            .get(index)
            .or_else(|| self.delays_ms.last())
            .copied()
            .unwrap_or(0);

        let jitter_ms = if self.jitter_factor > 0.0 && base > 0 {
            let range = base as f64 * self.jitter_factor;
            rand::thread_rng().gen_range(0.0..range).floor() as u64
        } else {
            0
        };

        Duration::from_millis(base.saturating_add(jitter_ms))
    }

    /// Number of distinct delays.
    #[must_use]
    pub fn len(&self) -> usize {
        self.delays_ms.len()
    }

    /// Whether the schedule has no delays.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.delays_ms.is_empty()
    }
}
