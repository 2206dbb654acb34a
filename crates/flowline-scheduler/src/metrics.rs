//! Scheduler counters. Operators watch these instead of an interactive surface.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Process-wide scheduler counters. Cheap to share behind an `Arc`.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    pub executions_fired: Counter,
    pub executions_already_existed: Counter,
    pub execution_failures: Counter,
    pub fire_retries: Counter,
    pub inactive_skips: Counter,
    pub catchup_fires: Counter,
    pub registrations: Counter,
    pub deregistrations: Counter,
    pub registration_failures: Counter,
    pub checkpoint_writes: Counter,
    pub checkpoint_write_failures: Counter,
    pub checkpoint_read_failures: Counter,
    pub loop_panics: Counter,
}

/// Point-in-time copy of [`SchedulerMetrics`], suitable for logging or export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub executions_fired: u64,
    pub executions_already_existed: u64,
    pub execution_failures: u64,
    pub fire_retries: u64,
    pub inactive_skips: u64,
    pub catchup_fires: u64,
    pub registrations: u64,
    pub deregistrations: u64,
    pub registration_failures: u64,
    pub checkpoint_writes: u64,
    pub checkpoint_write_failures: u64,
    pub checkpoint_read_failures: u64,
    pub loop_panics: u64,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            executions_fired: self.executions_fired.get(),
            executions_already_existed: self.executions_already_existed.get(),
            execution_failures: self.execution_failures.get(),
            fire_retries: self.fire_retries.get(),
            inactive_skips: self.inactive_skips.get(),
            catchup_fires: self.catchup_fires.get(),
            registrations: self.registrations.get(),
            deregistrations: self.deregistrations.get(),
            registration_failures: self.registration_failures.get(),
            checkpoint_writes: self.checkpoint_writes.get(),
            checkpoint_write_failures: self.checkpoint_write_failures.get(),
            checkpoint_read_failures: self.checkpoint_read_failures.get(),
            loop_panics: self.loop_panics.get(),
        }
    }
}
