//! Diagnostic counters for the task cache and the pool
//!
//! Collectors are injected, so independent pools and caches never share
//! counters unless the caller hands them the same collector.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::task::TaskState;

/// Receiver of pool and cache events
///
/// All methods default to no-ops so implementors only override what they
/// care about. Called from worker threads; implementations must not block.
pub trait PoolMetrics: Send + Sync {
    /// A task record was allocated by the cache
    fn task_created(&self) {}

    /// A task record was handed out by the cache
    fn task_acquired(&self) {}

    /// A task record was accepted back into the cache
    fn task_released(&self) {}

    /// A release was refused because the task was not in a reusable state
    fn task_discarded(&self) {}

    /// A task reached a terminal state
    fn task_finished(&self, _state: TaskState, _elapsed: Duration) {}

    /// A worker loop ended with a fault
    fn worker_fault(&self, _worker_id: usize) {}

    /// A faulted worker loop was restarted
    fn worker_respawned(&self, _worker_id: usize) {}
}

/// Collector that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl PoolMetrics for NoopMetrics {}

/// Shared no-op collector
pub fn noop() -> Arc<dyn PoolMetrics> {
    Arc::new(NoopMetrics)
}

/// Lock-free counter collector
#[derive(Debug, Default)]
pub struct AtomicPoolMetrics {
    created: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    discarded: AtomicU64,
    succeeded: AtomicU64,
    stopped: AtomicU64,
    panicked: AtomicU64,
    timed_out: AtomicU64,
    busy_micros: AtomicU64,
    worker_faults: AtomicU64,
    worker_respawns: AtomicU64,
}

impl AtomicPoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            tasks_created: self.created.load(Ordering::Relaxed),
            tasks_acquired: self.acquired.load(Ordering::Relaxed),
            tasks_released: self.released.load(Ordering::Relaxed),
            tasks_discarded: self.discarded.load(Ordering::Relaxed),
            tasks_succeeded: self.succeeded.load(Ordering::Relaxed),
            tasks_stopped: self.stopped.load(Ordering::Relaxed),
            tasks_panicked: self.panicked.load(Ordering::Relaxed),
            tasks_timed_out: self.timed_out.load(Ordering::Relaxed),
            busy_time: Duration::from_micros(self.busy_micros.load(Ordering::Relaxed)),
            worker_faults: self.worker_faults.load(Ordering::Relaxed),
            worker_respawns: self.worker_respawns.load(Ordering::Relaxed),
        }
    }
}

impl PoolMetrics for AtomicPoolMetrics {
    fn task_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    fn task_acquired(&self) {
        self.acquired.fetch_add(1, Ordering::Relaxed);
    }

    fn task_released(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    fn task_discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    fn task_finished(&self, state: TaskState, elapsed: Duration) {
        let counter = match state {
            TaskState::DoneSuccess => &self.succeeded,
            TaskState::RecoverErr => &self.panicked,
            TaskState::TerminatedTimeout => &self.timed_out,
            TaskState::TerminatedStopSignal | TaskState::TerminatedCtxClosed => &self.stopped,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.busy_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    fn worker_fault(&self, _worker_id: usize) {
        self.worker_faults.fetch_add(1, Ordering::Relaxed);
    }

    fn worker_respawned(&self, _worker_id: usize) {
        self.worker_respawns.fetch_add(1, Ordering::Relaxed);
    }
}

/// Serializable copy of [`AtomicPoolMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub tasks_created: u64,
    pub tasks_acquired: u64,
    pub tasks_released: u64,
    pub tasks_discarded: u64,
    pub tasks_succeeded: u64,
    pub tasks_stopped: u64,
    pub tasks_panicked: u64,
    pub tasks_timed_out: u64,
    #[serde(with = "crate::config::duration_millis")]
    pub busy_time: Duration,
    pub worker_faults: u64,
    pub worker_respawns: u64,
}

impl MetricsSnapshot {
    /// Tasks that reached any terminal state
    pub fn tasks_finished(&self) -> u64 {
        self.tasks_succeeded + self.tasks_stopped + self.tasks_panicked + self.tasks_timed_out
    }
}
