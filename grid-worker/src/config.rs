use std::time::Duration;

use rand::Rng;

/// Consecutive local task failures tolerated before backing off.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(100);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub failure_threshold: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
        }
    }
}

impl WorkerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max.max(base);
        self
    }

    /// Pause before the next task after `failures` consecutive failures.
    ///
    /// Zero up to the threshold, then doubling from the base with up to 50%
    /// jitter, never above the max.
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures <= self.failure_threshold {
            return Duration::ZERO;
        }
        let exponent = (failures - self.failure_threshold - 1).min(16);
        let delay = self
            .backoff_base
            .saturating_mul(1 << exponent)
            .min(self.backoff_max);

        let jitter_ms = (delay.as_millis() / 2) as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        (delay + jitter).min(self.backoff_max)
    }
}
