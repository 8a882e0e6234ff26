//! Counters a worker keeps about the tasks it ran.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::debug;

use common::{JobId, TaskId};

#[derive(Debug, Default)]
pub struct Telemetry {
    tasks_done: AtomicU64,
    tasks_failed: AtomicU64,
    execution_nanos: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub tasks_done: u64,
    pub tasks_failed: u64,
    pub execution_time: Duration,
}

impl TelemetrySnapshot {
    pub fn tasks_total(&self) -> u64 {
        self.tasks_done + self.tasks_failed
    }
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, job_id: &JobId, task_id: TaskId, success: bool, duration: Duration) {
        if success {
            self.tasks_done.fetch_add(1, Ordering::Relaxed);
        } else {
            self.tasks_failed.fetch_add(1, Ordering::Relaxed);
        }
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.execution_nanos.fetch_add(nanos, Ordering::Relaxed);
        debug!(
            job = %job_id,
            task = task_id,
            success,
            elapsed_us = duration.as_micros() as u64,
            "task executed"
        );
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            tasks_done: self.tasks_done.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            execution_time: Duration::from_nanos(self.execution_nanos.load(Ordering::Relaxed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_outcomes_and_time() {
        let telemetry = Telemetry::new();
        let job = JobId::from_raw("c-o-1");
        telemetry.record(&job, 0, true, Duration::from_millis(3));
        telemetry.record(&job, 1, false, Duration::from_millis(2));
        telemetry.record(&job, 2, true, Duration::from_millis(5));

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.tasks_done, 2);
        assert_eq!(snapshot.tasks_failed, 1);
        assert_eq!(snapshot.tasks_total(), 3);
        assert_eq!(snapshot.execution_time, Duration::from_millis(10));
    }
}
