//! Single worker loop servicing the shared task queue

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use super::state::WorkerState;
use crate::error::WorkerFault;
use crate::metrics::PoolMetrics;
use crate::task::{Task, TaskState};

/// Serializable view of a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub id: usize,
    pub state: WorkerState,
    pub task_in_process: Option<Uuid>,
}

struct WorkerInner {
    state: WorkerState,
    task_in_process: Option<Uuid>,
}

/// One long-lived loop that pulls tasks off the pool queue
///
/// The loop runs as a Tokio task; each work function runs on the blocking
/// thread pool so a CPU-bound task never stalls the async workers. A worker
/// has at most one task in process and never touches pool state: it either
/// exits its loop or reports a [`WorkerFault`] on the fault channel.
pub struct Worker {
    id: usize,
    inner: RwLock<WorkerInner>,
    stop: CancellationToken,
    scope: CancellationToken,
    queue: async_channel::Receiver<Task>,
    faults: mpsc::Sender<WorkerFault>,
    metrics: Arc<dyn PoolMetrics>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Worker {
    /// Create a worker in state [`WorkerState::New`]
    ///
    /// `scope` is the pool-wide cancellation scope; the worker's private stop
    /// signal is created here and lives as long as the worker.
    pub fn new(
        id: usize,
        queue: async_channel::Receiver<Task>,
        scope: CancellationToken,
        faults: mpsc::Sender<WorkerFault>,
        metrics: Arc<dyn PoolMetrics>,
    ) -> Self {
        Self {
            id,
            inner: RwLock::new(WorkerInner {
                state: WorkerState::New,
                task_in_process: None,
            }),
            stop: CancellationToken::new(),
            scope,
            queue,
            faults,
            metrics,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.inner.read().state
    }

    /// Task currently being executed
    pub fn task_in_process(&self) -> Option<Uuid> {
        self.inner.read().task_in_process
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        let inner = self.inner.read();
        WorkerSnapshot {
            id: self.id,
            state: inner.state,
            task_in_process: inner.task_in_process,
        }
    }

    /// Start the loop on `runtime`
    ///
    /// Accepted from `New` or `RecoverErr` (a restart of the loop after a
    /// fault); returns `None` for any other state.
    pub fn spawn(self: &Arc<Self>, runtime: &Handle) -> Option<JoinHandle<()>> {
        if !self.begin_run() {
            return None;
        }
        let worker = Arc::clone(self);
        Some(runtime.spawn(async move { worker.run_loop().await }))
    }

    /// Run the loop on the current task until it terminates or faults
    ///
    /// Returns false without running if the worker is not startable.
    pub async fn run(self: Arc<Self>) -> bool {
        if !self.begin_run() {
            return false;
        }
        self.run_loop().await;
        true
    }

    /// Ask the loop to exit once the current task (if any) is done
    ///
    /// Idempotent; ignored once the worker is terminating.
    pub fn stop(&self) -> bool {
        if !self.state().accepts_stop() {
            return false;
        }
        self.stop.cancel();
        true
    }

    /// Mark a worker that will not be restarted as terminated
    pub fn retire(&self) -> bool {
        let mut inner = self.inner.write();
        match inner.state {
            WorkerState::New | WorkerState::RecoverErr => {
                inner.state = WorkerState::Terminated;
                inner.task_in_process = None;
                true
            }
            _ => false,
        }
    }

    fn begin_run(&self) -> bool {
        let mut inner = self.inner.write();
        match inner.state {
            WorkerState::New | WorkerState::RecoverErr => {
                inner.state = WorkerState::Idle;
                true
            }
            state => {
                warn!(worker_id = self.id, %state, "Worker cannot start from this state");
                false
            }
        }
    }

    fn set_state(&self, state: WorkerState) {
        let mut inner = self.inner.write();
        inner.state = state;
        if state != WorkerState::Working {
            inner.task_in_process = None;
        }
    }

    async fn run_loop(self: Arc<Self>) {
        debug!(worker_id = self.id, "Worker started");

        loop {
            if self.stop.is_cancelled() {
                self.set_state(WorkerState::TerminatingStopSignal);
                break;
            }
            if self.scope.is_cancelled() {
                self.set_state(WorkerState::TerminatingParentCancelled);
                break;
            }

            let task = tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    self.set_state(WorkerState::TerminatingStopSignal);
                    break;
                }
                _ = self.scope.cancelled() => {
                    self.set_state(WorkerState::TerminatingParentCancelled);
                    break;
                }
                received = self.queue.recv() => match received {
                    Ok(task) => task,
                    Err(_) => {
                        self.set_state(WorkerState::TerminatingQueueClosed);
                        break;
                    }
                },
            };

            if let Err(fault) = self.process(task).await {
                error!(
                    worker_id = self.id,
                    task_id = ?fault.task_id,
                    "Worker fault: {}",
                    fault.message
                );
                self.set_state(WorkerState::RecoverErr);
                self.metrics.worker_fault(self.id);
                if let Err(e) = self.faults.try_send(fault) {
                    warn!(worker_id = self.id, "Fault not delivered: {}", e);
                }
                return;
            }
        }

        let reason = self.state();
        self.set_state(WorkerState::Terminated);
        debug!(worker_id = self.id, %reason, "Worker exited");
    }

    async fn process(&self, task: Task) -> Result<(), WorkerFault> {
        let task_id = task.id();
        {
            let mut inner = self.inner.write();
            inner.state = WorkerState::Working;
            inner.task_in_process = Some(task_id);
        }
        trace!(worker_id = self.id, %task_id, "Processing task");

        let runner = task.clone();
        let worker_id = self.id;
        let mut job = tokio::task::spawn_blocking(move || runner.execute(worker_id));

        let joined = match task.timeout() {
            Some(limit) => tokio::select! {
                joined = &mut job => joined,
                _ = tokio::time::sleep(limit) => {
                    debug!(worker_id = self.id, %task_id, ?limit, "Task exceeded its timeout");
                    task.expire();
                    (&mut job).await
                }
            },
            None => job.await,
        };

        match joined {
            Ok(Ok(state)) => {
                self.metrics.task_finished(state, task.elapsed());
                self.set_state(WorkerState::Idle);
                Ok(())
            }
            Ok(Err(fault)) => {
                self.metrics
                    .task_finished(TaskState::RecoverErr, task.elapsed());
                Err(fault)
            }
            Err(e) => {
                // Execution thread was lost before the task could finish.
                task.finish_stopped();
                Err(WorkerFault {
                    worker_id: self.id,
                    task_id: Some(task_id),
                    message: e.to_string(),
                })
            }
        }
    }
}
