/// Consecutive failures a worker may report for one job before it is banned.
pub const DEFAULT_BAN_THRESHOLD: u32 = 3;

/// Tasks an unbounded job may have in flight at once.
pub const DEFAULT_UNBOUNDED_WINDOW: usize = 64;

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// A worker is banned from a job once its consecutive failures exceed this.
    pub ban_threshold: u32,

    /// In-flight task window of unbounded jobs.
    pub unbounded_window: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            ban_threshold: DEFAULT_BAN_THRESHOLD,
            unbounded_window: DEFAULT_UNBOUNDED_WINDOW,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_ban_threshold(mut self, threshold: u32) -> Self {
        self.ban_threshold = threshold;
        self
    }

    pub fn with_unbounded_window(mut self, window: usize) -> Self {
        self.unbounded_window = window.max(1);
        self
    }
}
