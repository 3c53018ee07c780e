//! Free list of reusable task records

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::{Task, TaskOutput};
use crate::error::PoolError;
use crate::metrics::{self, PoolMetrics};

/// Object pool that amortizes task allocation
///
/// Safe to share between threads; `acquire` and `release` take an internal
/// lock for the span of a push or pop. Handles are cheap to clone and all
/// clones share one free list.
#[derive(Clone)]
pub struct TaskCache {
    free: Arc<Mutex<Vec<Task>>>,
    metrics: Arc<dyn PoolMetrics>,
}

impl Default for TaskCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCache")
            .field("idle", &self.idle())
            .finish()
    }
}

impl TaskCache {
    pub fn new() -> Self {
        Self::with_metrics(metrics::noop())
    }

    /// Cache reporting allocation traffic to `metrics`
    pub fn with_metrics(metrics: Arc<dyn PoolMetrics>) -> Self {
        Self {
            free: Arc::new(Mutex::new(Vec::new())),
            metrics,
        }
    }

    /// Hand out a recycled task, or a fresh one if the free list is empty
    pub fn acquire(&self) -> Task {
        self.metrics.task_acquired();

        let recycled = self.free.lock().pop();
        match recycled {
            Some(task) => {
                task.mark_acquired();
                trace!(task_id = %task.id(), "Reusing cached task");
                task
            }
            None => {
                self.metrics.task_created();
                Task::new()
            }
        }
    }

    /// Take a task back for reuse
    ///
    /// Clears its arguments and results and marks it
    /// [`ReturnedToCache`](super::TaskState::ReturnedToCache). Tasks that were
    /// stopped, panicked, timed out or are still pending are refused and
    /// simply dropped; returns whether the task was kept.
    pub fn release(&self, task: Task) -> bool {
        if !task.reset_for_cache() {
            trace!(task_id = %task.id(), state = %task.state(), "Task not reusable, dropping");
            self.metrics.task_discarded();
            return false;
        }

        self.metrics.task_released();
        self.free.lock().push(task);
        true
    }

    /// Acquire and configure in one step
    pub fn task<F>(
        &self,
        scope: &CancellationToken,
        name: impl Into<String>,
        work: F,
        args: Vec<Value>,
    ) -> Result<Task, PoolError>
    where
        F: Fn(&CancellationToken, &CancellationToken, &[Value]) -> TaskOutput
            + Send
            + Sync
            + 'static,
    {
        let task = self.acquire();
        task.configure(scope, work, args)?;
        Ok(task.with_name(name))
    }

    /// Number of tasks waiting in the free list
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::AtomicPoolMetrics;
    use crate::task::TaskState;
    use serde_json::json;

    fn echo(_: &CancellationToken, _: &CancellationToken, args: &[Value]) -> TaskOutput {
        TaskOutput::ok(args.to_vec())
    }

    #[test]
    fn test_acquire_from_empty_cache_is_fresh() {
        let cache = TaskCache::new();
        let task = cache.acquire();
        assert_eq!(task.state(), TaskState::Fresh);
        assert_eq!(cache.idle(), 0);
    }

    #[test]
    fn test_released_task_comes_back_clean() {
        let cache = TaskCache::new();
        let scope = CancellationToken::new();
        let task = cache
            .task(&scope, "first", echo, vec![json!({"x": 1}), json!(2)])
            .unwrap();
        task.execute(1).unwrap();
        assert_eq!(task.results().len(), 2);
        let handle = task.clone();

        assert!(cache.release(task));
        assert_eq!(handle.state(), TaskState::ReturnedToCache);
        assert_eq!(cache.idle(), 1);

        let again = cache.acquire();
        assert_eq!(again.state(), TaskState::Acquired);
        assert!(again.args().is_empty());
        assert!(again.results().is_empty());
        assert!(again.error().is_none());
        assert!(again.name().is_empty());
        assert_eq!(cache.idle(), 0);
    }

    #[test]
    fn test_stopped_task_is_not_recycled() {
        let metrics = Arc::new(AtomicPoolMetrics::new());
        let cache = TaskCache::with_metrics(metrics.clone());
        let scope = CancellationToken::new();
        let task = cache.task(&scope, "stopped", echo, vec![json!(1)]).unwrap();
        task.begin_submit().unwrap();
        task.finish_stopped();

        assert!(!cache.release(task.clone()));
        assert_eq!(cache.idle(), 0);
        assert_eq!(task.state(), TaskState::TerminatedStopSignal);
        assert_eq!(metrics.snapshot().tasks_discarded, 1);
    }

    #[test]
    fn test_pending_task_is_not_recycled() {
        let cache = TaskCache::new();
        let scope = CancellationToken::new();
        let task = cache.task(&scope, "pending", echo, vec![]).unwrap();
        assert!(!cache.release(task));
    }

    #[test]
    fn test_fresh_task_can_be_released() {
        let cache = TaskCache::new();
        assert!(cache.release(Task::new()));
        assert!(cache.release(cache.acquire()));
        assert_eq!(cache.idle(), 2);
    }

    #[test]
    fn test_counters() {
        let metrics = Arc::new(AtomicPoolMetrics::new());
        let cache = TaskCache::with_metrics(metrics.clone());

        let a = cache.acquire();
        let b = cache.acquire();
        cache.release(a);
        let _c = cache.acquire();
        cache.release(b);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.tasks_acquired, 3);
        assert_eq!(snapshot.tasks_created, 2);
        assert_eq!(snapshot.tasks_released, 2);
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let cache = TaskCache::new();
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let task = cache.acquire();
                        assert!(cache.release(task));
                    }
                })
            })
            .collect();

        for handle in threads {
            handle.join().unwrap();
        }
        assert!(cache.idle() <= 8);
        assert!(cache.idle() >= 1);
    }
}
