//! Tasks: opaque, cancellable units of work
//!
//! This module provides:
//! - [`Task`] - shared handle to a work function, its arguments and outcome
//! - [`TaskCache`] - free list that recycles task records
//! - [`CompletionBarrier`] - releases once a batch of tasks is terminal
//!
//! A task never interprets its arguments or results. The work function gets
//! two cancellation scopes: the outer scope the task was configured under and
//! a per-task inner scope (a child of the outer one) that fires on
//! [`Task::request_stop`] or on a cooperative timeout. Neither scope preempts
//! a running function; well-behaved work functions poll them.

mod barrier;
mod cache;
mod state;

pub use barrier::CompletionBarrier;
pub use cache::TaskCache;
pub use state::TaskState;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{PoolError, TaskError, WorkerFault};

/// What a work function hands back
///
/// Error and results are independent: a function may report an error and
/// still return partial results.
#[derive(Debug, Default)]
pub struct TaskOutput {
    pub error: Option<anyhow::Error>,
    pub results: Vec<Value>,
}

impl TaskOutput {
    /// Successful output
    pub fn ok(results: Vec<Value>) -> Self {
        Self {
            error: None,
            results,
        }
    }

    /// Failed output without results
    pub fn err(error: impl Into<anyhow::Error>) -> Self {
        Self {
            error: Some(error.into()),
            results: Vec::new(),
        }
    }

    /// Attach an error to an existing output
    pub fn with_error(mut self, error: impl Into<anyhow::Error>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Work function: `(outer scope, inner scope, args) -> output`
pub type WorkFn =
    Arc<dyn Fn(&CancellationToken, &CancellationToken, &[Value]) -> TaskOutput + Send + Sync>;

/// Serializable view of a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: Uuid,
    pub name: String,
    pub state: TaskState,
    pub previous_state: TaskState,
    pub worker_id: Option<usize>,
    pub elapsed_micros: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub result_count: usize,
}

struct TaskInner {
    id: Uuid,
    name: String,
    state: TaskState,
    prev_state: TaskState,

    outer: CancellationToken,
    inner: CancellationToken,
    stop_requested: bool,
    timed_out: Option<Duration>,

    work: Option<WorkFn>,
    args: Arc<[Value]>,
    results: Vec<Value>,
    error: Option<Arc<TaskError>>,

    barrier: Option<Arc<CompletionBarrier>>,
    notifier: Option<mpsc::UnboundedSender<Uuid>>,
    timeout: Option<Duration>,

    worker_id: Option<usize>,
    elapsed: Duration,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TaskInner {
    fn set_state(&mut self, state: TaskState) {
        self.prev_state = self.state;
        self.state = state;
    }

    fn clear(&mut self) {
        self.work = None;
        self.args = Arc::from(Vec::new());
        self.results = Vec::new();
        self.error = None;
        self.barrier = None;
        self.notifier = None;
        self.timeout = None;
        self.timed_out = None;
        self.stop_requested = false;
        self.worker_id = None;
        self.elapsed = Duration::ZERO;
        self.started_at = None;
        self.finished_at = None;
    }

    /// Move to a terminal state and hand back the signals to fire
    fn finish(&mut self, state: TaskState) -> Completion {
        self.set_state(state);
        self.finished_at = Some(Utc::now());
        Completion {
            id: self.id,
            barrier: self.barrier.clone(),
            notifier: self.notifier.clone(),
        }
    }
}

/// Signals owed once a task is terminal, fired outside the task lock
struct Completion {
    id: Uuid,
    barrier: Option<Arc<CompletionBarrier>>,
    notifier: Option<mpsc::UnboundedSender<Uuid>>,
}

impl Completion {
    fn fire(self) {
        if let Some(barrier) = self.barrier {
            barrier.done();
        }
        if let Some(notifier) = self.notifier {
            // Receiver may be gone; notification is best effort.
            let _ = notifier.send(self.id);
        }
    }
}

/// Shared handle to a unit of work
///
/// Cloning the handle does not copy the task. A task is executed by exactly
/// one worker per configuration cycle; the `Ready -> Queued` transition on
/// submission keeps it from being enqueued twice.
///
/// # Example
///
/// ```
/// use raytask_pool::task::{Task, TaskOutput};
/// use serde_json::json;
/// use tokio_util::sync::CancellationToken;
///
/// let scope = CancellationToken::new();
/// let task = Task::new();
/// task.configure(&scope, |_outer, _inner, args| {
///     TaskOutput::ok(vec![json!(args.len())])
/// }, vec![json!(1), json!(2)])
/// .unwrap();
///
/// assert_eq!(task.args().len(), 2);
/// ```
#[derive(Clone)]
pub struct Task {
    inner: Arc<RwLock<TaskInner>>,
}

impl Default for Task {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let t = self.inner.read();
        f.debug_struct("Task")
            .field("id", &t.id)
            .field("name", &t.name)
            .field("state", &t.state)
            .field("args", &t.args.len())
            .field("results", &t.results.len())
            .finish()
    }
}

impl Task {
    /// Allocate a task in state [`TaskState::Fresh`]
    pub fn new() -> Self {
        let outer = CancellationToken::new();
        let inner = outer.child_token();
        Self {
            inner: Arc::new(RwLock::new(TaskInner {
                id: Uuid::now_v7(),
                name: String::new(),
                state: TaskState::Fresh,
                prev_state: TaskState::Fresh,
                outer,
                inner,
                stop_requested: false,
                timed_out: None,
                work: None,
                args: Arc::from(Vec::new()),
                results: Vec::new(),
                error: None,
                barrier: None,
                notifier: None,
                timeout: None,
                worker_id: None,
                elapsed: Duration::ZERO,
                started_at: None,
                finished_at: None,
            })),
        }
    }

    /// Bind a work function and its arguments under `scope`
    ///
    /// Assigns a new task id, derives a fresh inner scope from `scope`,
    /// clears any previous outcome, barrier and notifier, and moves the task
    /// to [`TaskState::Ready`]. Fails while the task is queued or running.
    pub fn configure<F>(
        &self,
        scope: &CancellationToken,
        work: F,
        args: Vec<Value>,
    ) -> Result<(), PoolError>
    where
        F: Fn(&CancellationToken, &CancellationToken, &[Value]) -> TaskOutput
            + Send
            + Sync
            + 'static,
    {
        self.configure_shared(scope, Arc::new(work), args)
    }

    /// [`configure`](Self::configure) with an already shared work function
    pub fn configure_shared(
        &self,
        scope: &CancellationToken,
        work: WorkFn,
        args: Vec<Value>,
    ) -> Result<(), PoolError> {
        let mut t = self.inner.write();
        if matches!(t.state, TaskState::Queued | TaskState::InProgress) {
            return Err(PoolError::TaskNotReady {
                task_id: t.id,
                state: t.state,
            });
        }

        t.clear();
        t.id = Uuid::now_v7();
        t.outer = scope.clone();
        t.inner = scope.child_token();
        t.work = Some(work);
        t.args = Arc::from(args);
        t.set_state(TaskState::Ready);
        Ok(())
    }

    /// Set a human-readable name
    pub fn with_name(self, name: impl Into<String>) -> Self {
        self.inner.write().name = name.into();
        self
    }

    /// Cancel the inner scope if the function is still running after `timeout`
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.inner.write().timeout = Some(timeout);
        self
    }

    /// Send the task id on `tx` when the task reaches a terminal state
    pub fn with_notifier(self, tx: mpsc::UnboundedSender<Uuid>) -> Self {
        self.inner.write().notifier = Some(tx);
        self
    }

    /// Attach the completion barrier the pool registers this task with
    ///
    /// Refused unless the task is `Ready`: a task already submitted keeps
    /// counting against the barrier it was submitted with.
    pub fn attach_barrier(&self, barrier: Arc<CompletionBarrier>) -> bool {
        let mut t = self.inner.write();
        if t.state != TaskState::Ready {
            return false;
        }
        t.barrier = Some(barrier);
        true
    }

    /// Ask the task not to run
    ///
    /// Only effective before a worker starts it; returns whether the request
    /// took. A running task is never interrupted.
    pub fn request_stop(&self) -> bool {
        let mut t = self.inner.write();
        if !t.state.is_pending() || t.stop_requested {
            return false;
        }
        t.stop_requested = true;
        t.inner.cancel();
        true
    }

    pub fn id(&self) -> Uuid {
        self.inner.read().id
    }

    pub fn name(&self) -> String {
        self.inner.read().name.clone()
    }

    pub fn state(&self) -> TaskState {
        self.inner.read().state
    }

    pub fn previous_state(&self) -> TaskState {
        self.inner.read().prev_state
    }

    /// Error recorded by the last execution
    pub fn error(&self) -> Option<Arc<TaskError>> {
        self.inner.read().error.clone()
    }

    /// Results recorded by the last execution
    pub fn results(&self) -> Vec<Value> {
        self.inner.read().results.clone()
    }

    /// Arguments bound by the last `configure`
    pub fn args(&self) -> Arc<[Value]> {
        Arc::clone(&self.inner.read().args)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.inner.read().timeout
    }

    /// Time the work function ran
    pub fn elapsed(&self) -> Duration {
        self.inner.read().elapsed
    }

    /// Worker that executed the task
    pub fn worker_id(&self) -> Option<usize> {
        self.inner.read().worker_id
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        let t = self.inner.read();
        TaskSnapshot {
            id: t.id,
            name: t.name.clone(),
            state: t.state,
            previous_state: t.prev_state,
            worker_id: t.worker_id,
            elapsed_micros: t.elapsed.as_micros() as u64,
            started_at: t.started_at,
            finished_at: t.finished_at,
            error: t.error.as_ref().map(|e| e.to_string()),
            result_count: t.results.len(),
        }
    }

    /// `Ready -> Queued` and register with the barrier
    pub(crate) fn begin_submit(&self) -> Result<(), PoolError> {
        self.begin_submit_with(None)
    }

    /// Same as [`begin_submit`](Self::begin_submit), swapping in `barrier`
    /// under the same lock as the state check
    pub(crate) fn begin_submit_with(
        &self,
        barrier: Option<Arc<CompletionBarrier>>,
    ) -> Result<(), PoolError> {
        let mut t = self.inner.write();
        if t.state != TaskState::Ready {
            return Err(PoolError::TaskNotReady {
                task_id: t.id,
                state: t.state,
            });
        }
        if barrier.is_some() {
            t.barrier = barrier;
        }
        t.set_state(TaskState::Queued);
        if let Some(barrier) = &t.barrier {
            barrier.add(1);
        }
        Ok(())
    }

    /// Undo [`begin_submit`](Self::begin_submit) after a failed enqueue
    pub(crate) fn abort_submit(&self) {
        let mut t = self.inner.write();
        if t.state != TaskState::Queued {
            return;
        }
        t.set_state(TaskState::Ready);
        if let Some(barrier) = &t.barrier {
            barrier.done();
        }
    }

    /// Stop a task drained from a queue that will never reach a worker
    pub(crate) fn finish_stopped(&self) -> bool {
        let completion = {
            let mut t = self.inner.write();
            if !t.state.is_pending() {
                return false;
            }
            t.stop_requested = true;
            t.inner.cancel();
            t.finish(TaskState::TerminatedStopSignal)
        };
        completion.fire();
        true
    }

    /// Cancel the inner scope of a running task whose timeout elapsed
    pub(crate) fn expire(&self) {
        let mut t = self.inner.write();
        if t.state != TaskState::InProgress {
            return;
        }
        t.timed_out = t.timeout;
        t.inner.cancel();
    }

    /// Run the work function; called by exactly one worker per cycle
    ///
    /// Returns the terminal state, or a fault if the work function panicked.
    /// The barrier and notifier are signalled on every terminal path.
    pub(crate) fn execute(&self, worker_id: usize) -> Result<TaskState, WorkerFault> {
        let (work, outer, inner, args) = {
            let mut t = self.inner.write();
            if !t.state.is_pending() {
                return Ok(t.state);
            }
            t.worker_id = Some(worker_id);

            let stopped = if t.outer.is_cancelled() {
                Some(TaskState::TerminatedCtxClosed)
            } else if t.stop_requested || t.inner.is_cancelled() {
                Some(TaskState::TerminatedStopSignal)
            } else {
                None
            };

            let work = match (stopped, t.work.clone()) {
                (None, Some(work)) => work,
                (stopped, _) => {
                    let state = stopped.unwrap_or(TaskState::TerminatedStopSignal);
                    let completion = t.finish(state);
                    drop(t);
                    completion.fire();
                    return Ok(state);
                }
            };

            t.set_state(TaskState::InProgress);
            t.started_at = Some(Utc::now());
            (work, t.outer.clone(), t.inner.clone(), Arc::clone(&t.args))
        };

        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(&outer, &inner, &args[..])));
        let elapsed = started.elapsed();

        let (state, fault, completion) = {
            let mut t = self.inner.write();
            t.elapsed = elapsed;

            let (state, fault) = match outcome {
                Ok(output) => {
                    t.results = output.results;
                    t.error = output.error.map(|e| Arc::new(TaskError::Work(e)));
                    match t.timed_out {
                        Some(limit) => {
                            if t.error.is_none() {
                                t.error = Some(Arc::new(TaskError::TimedOut(limit)));
                            }
                            (TaskState::TerminatedTimeout, None)
                        }
                        None => (TaskState::DoneSuccess, None),
                    }
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    t.results = Vec::new();
                    t.error = Some(Arc::new(TaskError::Panicked(message.clone())));
                    let fault = WorkerFault {
                        worker_id,
                        task_id: Some(t.id),
                        message,
                    };
                    (TaskState::RecoverErr, Some(fault))
                }
            };

            (state, fault, t.finish(state))
        };
        completion.fire();

        match fault {
            Some(fault) => Err(fault),
            None => Ok(state),
        }
    }

    /// Clear for reuse if the state allows it; used by [`TaskCache`]
    pub(crate) fn reset_for_cache(&self) -> bool {
        let mut t = self.inner.write();
        if !t.state.is_reusable() {
            return false;
        }
        t.clear();
        t.name.clear();
        t.set_state(TaskState::ReturnedToCache);
        true
    }

    /// Mark a recycled task as handed out again
    pub(crate) fn mark_acquired(&self) {
        let mut t = self.inner.write();
        if t.state != TaskState::Fresh {
            t.set_state(TaskState::Acquired);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn echo(_: &CancellationToken, _: &CancellationToken, args: &[Value]) -> TaskOutput {
        TaskOutput::ok(args.to_vec())
    }

    fn ready_task(scope: &CancellationToken) -> Task {
        let task = Task::new();
        task.configure(scope, echo, vec![json!(1), json!("two")])
            .unwrap();
        task
    }

    #[test]
    fn test_new_task_is_fresh() {
        let task = Task::new();
        assert_eq!(task.state(), TaskState::Fresh);
        assert!(task.args().is_empty());
        assert!(task.results().is_empty());
        assert!(task.error().is_none());
    }

    #[test]
    fn test_configure_moves_to_ready() {
        let scope = CancellationToken::new();
        let task = Task::new();
        let first_id = task.id();
        task.configure(&scope, echo, vec![json!(1)]).unwrap();

        assert_eq!(task.state(), TaskState::Ready);
        assert_eq!(task.previous_state(), TaskState::Fresh);
        assert_ne!(task.id(), first_id);
    }

    #[test]
    fn test_execute_stores_results() {
        let scope = CancellationToken::new();
        let task = ready_task(&scope);
        task.begin_submit().unwrap();

        let state = task.execute(7).unwrap();

        assert_eq!(state, TaskState::DoneSuccess);
        assert_eq!(task.results(), vec![json!(1), json!("two")]);
        assert!(task.error().is_none());
        assert_eq!(task.worker_id(), Some(7));
    }

    #[test]
    fn test_work_error_is_data_not_state() {
        let scope = CancellationToken::new();
        let task = Task::new();
        task.configure(
            &scope,
            |_, _, _| TaskOutput::ok(vec![json!("partial")]).with_error(anyhow::anyhow!("bad pixel")),
            vec![],
        )
        .unwrap();

        assert_eq!(task.execute(1).unwrap(), TaskState::DoneSuccess);
        let error = task.error().unwrap();
        assert!(matches!(*error, TaskError::Work(_)));
        assert_eq!(error.to_string(), "bad pixel");
        assert_eq!(task.results(), vec![json!("partial")]);
    }

    #[test]
    fn test_execute_runs_at_most_once() {
        let scope = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let task = Task::new();
        let counter = Arc::clone(&calls);
        task.configure(
            &scope,
            move |_, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                TaskOutput::default()
            },
            vec![],
        )
        .unwrap();

        task.execute(1).unwrap();
        task.execute(2).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(task.worker_id(), Some(1));
    }

    #[test]
    fn test_request_stop_before_execution() {
        let scope = CancellationToken::new();
        let task = ready_task(&scope);
        let barrier = Arc::new(CompletionBarrier::new());
        task.attach_barrier(Arc::clone(&barrier));
        task.begin_submit().unwrap();
        assert_eq!(barrier.pending(), 1);

        assert!(task.request_stop());
        assert!(!task.request_stop());
        assert_eq!(task.execute(1).unwrap(), TaskState::TerminatedStopSignal);

        assert!(task.results().is_empty());
        assert_eq!(barrier.pending(), 0);
    }

    #[test]
    fn test_submitted_task_keeps_its_barrier() {
        let scope = CancellationToken::new();
        let task = ready_task(&scope);
        let first = Arc::new(CompletionBarrier::new());
        task.begin_submit_with(Some(Arc::clone(&first))).unwrap();

        let second = Arc::new(CompletionBarrier::new());
        assert!(!task.attach_barrier(Arc::clone(&second)));
        assert!(task.begin_submit_with(Some(Arc::clone(&second))).is_err());
        assert_eq!(first.pending(), 1);

        task.execute(1).unwrap();
        assert_eq!(first.pending(), 0);
        assert_eq!(second.pending(), 0);
    }

    #[test]
    fn test_request_stop_after_completion_is_ignored() {
        let scope = CancellationToken::new();
        let task = ready_task(&scope);
        task.execute(1).unwrap();
        assert!(!task.request_stop());
        assert_eq!(task.state(), TaskState::DoneSuccess);
    }

    #[test]
    fn test_cancelled_outer_scope_skips_work() {
        let scope = CancellationToken::new();
        let task = ready_task(&scope);
        scope.cancel();

        assert_eq!(task.execute(1).unwrap(), TaskState::TerminatedCtxClosed);
        assert!(task.results().is_empty());
    }

    #[test]
    fn test_work_sees_both_scopes_live() {
        let scope = CancellationToken::new();
        let task = Task::new();
        task.configure(
            &scope,
            |outer, inner, _| {
                TaskOutput::ok(vec![json!(outer.is_cancelled()), json!(inner.is_cancelled())])
            },
            vec![],
        )
        .unwrap();

        task.execute(1).unwrap();
        assert_eq!(task.results(), vec![json!(false), json!(false)]);
    }

    #[test]
    fn test_panic_becomes_fault() {
        let scope = CancellationToken::new();
        let task = Task::new();
        task.configure(&scope, |_, _, _| panic!("shader exploded"), vec![])
            .unwrap();
        let barrier = Arc::new(CompletionBarrier::new());
        task.attach_barrier(Arc::clone(&barrier));
        task.begin_submit().unwrap();

        let fault = task.execute(4).unwrap_err();

        assert_eq!(fault.worker_id, 4);
        assert_eq!(fault.task_id, Some(task.id()));
        assert!(fault.message.contains("shader exploded"));
        assert_eq!(task.state(), TaskState::RecoverErr);
        assert!(matches!(*task.error().unwrap(), TaskError::Panicked(_)));
        assert_eq!(barrier.pending(), 0);
    }

    #[test]
    fn test_expire_marks_timeout() {
        let scope = CancellationToken::new();
        let task = Task::new().with_timeout(Duration::from_millis(5));
        let handle = task.clone();
        task.configure(
            &scope,
            move |_, inner, _| {
                handle.expire();
                TaskOutput::ok(vec![json!(inner.is_cancelled())])
            },
            vec![],
        )
        .unwrap();

        assert_eq!(task.execute(1).unwrap(), TaskState::TerminatedTimeout);
        assert_eq!(task.results(), vec![json!(true)]);
        assert!(matches!(*task.error().unwrap(), TaskError::TimedOut(_)));
    }

    #[test]
    fn test_configure_rejected_while_queued() {
        let scope = CancellationToken::new();
        let task = ready_task(&scope);
        task.begin_submit().unwrap();

        let err = task.configure(&scope, echo, vec![]).unwrap_err();
        assert!(matches!(
            err,
            PoolError::TaskNotReady {
                state: TaskState::Queued,
                ..
            }
        ));
    }

    #[test]
    fn test_double_submit_rejected() {
        let scope = CancellationToken::new();
        let task = ready_task(&scope);
        task.begin_submit().unwrap();
        assert!(task.begin_submit().is_err());

        task.abort_submit();
        assert_eq!(task.state(), TaskState::Ready);
    }

    #[test]
    fn test_finish_stopped_fires_notifier() {
        let scope = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = ready_task(&scope).with_notifier(tx);
        task.begin_submit().unwrap();

        assert!(task.finish_stopped());
        assert_eq!(task.state(), TaskState::TerminatedStopSignal);
        assert_eq!(rx.try_recv().unwrap(), task.id());
        assert!(!task.finish_stopped());
    }

    #[test]
    fn test_snapshot_reports_outcome() {
        let scope = CancellationToken::new();
        let task = ready_task(&scope).with_name("pixel-0-0");
        task.execute(2).unwrap();

        let snapshot = task.snapshot();
        assert_eq!(snapshot.name, "pixel-0-0");
        assert_eq!(snapshot.state, TaskState::DoneSuccess);
        assert_eq!(snapshot.result_count, 2);
        assert!(snapshot.finished_at.is_some());
        assert!(snapshot.error.is_none());
    }
}
