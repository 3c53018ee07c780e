//! Worker pool owning the shared task queue
//!
//! Manages the worker set, the pool lifecycle and shutdown.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::runner::{Worker, WorkerSnapshot};
use super::state::{PoolState, ShutdownMode, WorkerState};
use crate::config::PoolConfig;
use crate::error::{PoolError, WorkerFault};
use crate::metrics::{self, PoolMetrics};
use crate::task::{CompletionBarrier, Task, TaskState};

/// Outcome counts for a set of tasks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    /// Ran to completion without an error
    pub succeeded: usize,
    /// Ran to completion and reported an error
    pub failed: usize,
    pub stopped: usize,
    pub panicked: usize,
    pub timed_out: usize,
    /// Never reached a terminal state (not submitted, or still pending)
    pub pending: usize,
    pub worker_faults: usize,
    #[serde(with = "crate::config::duration_millis")]
    pub elapsed: Duration,
}

impl RunSummary {
    /// Tally the current states of `tasks`
    pub fn from_tasks(tasks: &[Task]) -> Self {
        let mut summary = Self {
            total: tasks.len(),
            ..Default::default()
        };

        for task in tasks {
            match task.state() {
                TaskState::DoneSuccess if task.error().is_some() => summary.failed += 1,
                TaskState::DoneSuccess => summary.succeeded += 1,
                TaskState::TerminatedStopSignal | TaskState::TerminatedCtxClosed => {
                    summary.stopped += 1
                }
                TaskState::RecoverErr => summary.panicked += 1,
                TaskState::TerminatedTimeout => summary.timed_out += 1,
                _ => summary.pending += 1,
            }
        }

        summary
    }

    /// True if every task ran to completion
    pub fn is_complete(&self) -> bool {
        self.succeeded + self.failed == self.total
    }
}

struct PoolInner {
    state: PoolState,
    background: bool,
    runtime: Option<Handle>,
    scope: Option<CancellationToken>,
    stop_signal: CancellationToken,
    queue_tx: Option<async_channel::Sender<Task>>,
    queue_rx: Option<async_channel::Receiver<Task>>,
    workers: BTreeMap<usize, Arc<Worker>>,
    fault_tx: Option<mpsc::Sender<WorkerFault>>,
}

/// Bounded pool of long-lived workers
///
/// # Example
///
/// ```ignore
/// use raytask_pool::{Pool, PoolConfig, ShutdownMode};
///
/// let root = CancellationToken::new();
/// let pool = Arc::new(Pool::new(&root, 1, "render", PoolConfig::default()));
///
/// let aggregation = pool.run_background()?;
/// pool.add_task(&task).await?;
///
/// pool.stop(ShutdownMode::Soft).await?;
/// aggregation.await??;
/// ```
pub struct Pool {
    id: u64,
    name: String,
    config: PoolConfig,
    parent: CancellationToken,
    metrics: Arc<dyn PoolMetrics>,
    inner: RwLock<PoolInner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Pool {
    /// Create a pool in state [`PoolState::New`]
    ///
    /// `parent` is the process-wide scope: cancelling it forces a hard
    /// shutdown. Zero-valued sizes in `config` are replaced by defaults.
    pub fn new(
        parent: &CancellationToken,
        id: u64,
        name: impl Into<String>,
        config: PoolConfig,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            config: config.resolved(),
            parent: parent.clone(),
            metrics: metrics::noop(),
            inner: RwLock::new(PoolInner {
                state: PoolState::New,
                background: false,
                runtime: None,
                scope: None,
                stop_signal: CancellationToken::new(),
                queue_tx: None,
                queue_rx: None,
                workers: BTreeMap::new(),
                fault_tx: None,
            }),
        }
    }

    /// Report task and worker events to `metrics`
    pub fn with_metrics(mut self, metrics: Arc<dyn PoolMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolved configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn state(&self) -> PoolState {
        self.inner.read().state
    }

    pub fn is_background(&self) -> bool {
        self.inner.read().background
    }

    /// States of all workers, ordered by id
    pub fn worker_states(&self) -> Vec<WorkerSnapshot> {
        self.inner
            .read()
            .workers
            .values()
            .map(|w| w.snapshot())
            .collect()
    }

    /// Tasks waiting in the queue
    pub fn queued(&self) -> usize {
        self.inner
            .read()
            .queue_rx
            .as_ref()
            .map(|rx| rx.len())
            .unwrap_or(0)
    }

    /// Start the workers and the fault aggregation loop
    ///
    /// The only `New -> BgRunning` transition. Returns the handle of the
    /// aggregation loop, which ends when the pool is stopped, or with the
    /// escalated fault when `respawn_on_fault` is off. Fails without side
    /// effects unless the pool is `New`.
    #[instrument(skip(self), fields(pool = %self.name, pool_id = self.id))]
    pub fn run_background(
        self: &Arc<Self>,
    ) -> Result<JoinHandle<Result<(), PoolError>>, PoolError> {
        let runtime = Handle::try_current();

        let mut inner = self.inner.write();
        if inner.state != PoolState::New {
            warn!(state = %inner.state, "Pool already started");
            return Err(PoolError::InvalidState {
                state: inner.state,
                expected: "new",
            });
        }

        let runtime = match runtime {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("Cannot start pool outside a Tokio runtime: {}", e);
                inner.state = PoolState::Shutdown;
                inner.stop_signal.cancel();
                return Err(PoolError::NoRuntime(e.to_string()));
            }
        };

        inner.state = PoolState::BgRunning;
        inner.background = true;
        let (fault_rx, workers) = self.start_workers(&mut inner, &runtime);
        let stop_signal = inner.stop_signal.clone();
        drop(inner);
        self.spawn_workers(&workers, &runtime);

        info!(
            workers = self.config.worker_concurrency,
            queue_size = self.config.task_queue_size,
            "Pool running in background"
        );

        let pool = Arc::clone(self);
        Ok(runtime.spawn(async move { pool.aggregate(fault_rx, stop_signal).await }))
    }

    /// Run `tasks` to completion on a fresh worker set, without backgrounding
    ///
    /// `New -> OnlineRunning -> OnlineDone | IncompleteDone`. Tasks that are
    /// not `Ready` are left untouched and reported as pending. Cancelling the
    /// parent scope cuts the run short; undispatched tasks end stopped.
    #[instrument(skip(self, tasks), fields(pool = %self.name, pool_id = self.id, tasks = tasks.len()))]
    pub async fn run_foreground(&self, tasks: &[Task]) -> Result<RunSummary, PoolError> {
        let started = Instant::now();
        let runtime = Handle::try_current().map_err(|e| PoolError::NoRuntime(e.to_string()))?;

        let (queue_tx, queue_rx, scope, workers, mut fault_rx) = {
            let mut inner = self.inner.write();
            if inner.state != PoolState::New {
                return Err(PoolError::InvalidState {
                    state: inner.state,
                    expected: "new",
                });
            }
            inner.state = PoolState::OnlineRunning;
            let (fault_rx, workers) = self.start_workers(&mut inner, &runtime);
            (
                inner.queue_tx.clone(),
                inner.queue_rx.clone(),
                inner.scope.clone(),
                workers,
                fault_rx,
            )
        };
        self.spawn_workers(&workers, &runtime);
        let (Some(queue_tx), Some(queue_rx), Some(scope)) = (queue_tx, queue_rx, scope) else {
            return Err(PoolError::QueueClosed);
        };

        info!("Running batch in foreground");

        let mut worker_faults = 0;
        for task in tasks {
            if let Err(e) = task.begin_submit() {
                debug!("Skipping task: {}", e);
                continue;
            }
            let sent = loop {
                tokio::select! {
                    sent = queue_tx.send(task.clone()) => break sent.is_ok(),
                    _ = scope.cancelled() => break false,
                    Some(fault) = fault_rx.recv() => {
                        worker_faults += 1;
                        self.recover_foreground(&fault, &runtime);
                        if workers.iter().all(|w| w.state() == WorkerState::Terminated) {
                            warn!("No workers left, abandoning submission");
                            break false;
                        }
                    }
                }
            };
            if !sent {
                task.abort_submit();
                break;
            }
        }
        queue_tx.close();

        // Faults are recovered here rather than by the shutdown poll, so a
        // restarted worker keeps draining the closed queue.
        loop {
            while let Ok(fault) = fault_rx.try_recv() {
                worker_faults += 1;
                self.recover_foreground(&fault, &runtime);
            }
            if workers.iter().all(|w| w.state() == WorkerState::Terminated) {
                break;
            }
            tokio::time::sleep(self.config.worker_poll_interval).await;
        }
        self.drain(&queue_rx);

        let mut summary = RunSummary::from_tasks(tasks);
        summary.worker_faults = worker_faults;
        summary.elapsed = started.elapsed();

        let done = if summary.succeeded + summary.failed == summary.total {
            PoolState::OnlineDone
        } else {
            PoolState::IncompleteDone
        };
        {
            let mut inner = self.inner.write();
            if inner.state == PoolState::OnlineRunning {
                inner.state = done;
            }
            inner.fault_tx = None;
        }

        info!(state = %done, succeeded = summary.succeeded, "Foreground batch finished");
        Ok(summary)
    }

    /// Submit a task, waiting for room if the queue is full
    ///
    /// Fails with a state error unless the pool is `BgRunning`. Never call
    /// this from inside a work function of the same pool: a full queue would
    /// wait on the worker doing the submitting. Use
    /// [`try_add_task`](Self::try_add_task) there.
    pub async fn add_task(&self, task: &Task) -> Result<(), PoolError> {
        self.enqueue(task, None).await
    }

    /// Submit a task that counts against `barrier`
    ///
    /// The barrier replaces the task's previous one only if the task is
    /// accepted, so a task still owned by another batch is left alone.
    pub async fn add_task_to_barrier(
        &self,
        task: &Task,
        barrier: &Arc<CompletionBarrier>,
    ) -> Result<(), PoolError> {
        self.enqueue(task, Some(Arc::clone(barrier))).await
    }

    async fn enqueue(
        &self,
        task: &Task,
        barrier: Option<Arc<CompletionBarrier>>,
    ) -> Result<(), PoolError> {
        let sender = self.sender()?;
        task.begin_submit_with(barrier)?;

        if sender.send(task.clone()).await.is_err() {
            task.abort_submit();
            return Err(PoolError::QueueClosed);
        }
        Ok(())
    }

    /// Submit a task only if the queue has room right now
    pub fn try_add_task(&self, task: &Task) -> Result<(), PoolError> {
        let sender = self.sender()?;
        task.begin_submit()?;

        match sender.try_send(task.clone()) {
            Ok(()) => Ok(()),
            Err(async_channel::TrySendError::Full(_)) => {
                task.abort_submit();
                Err(PoolError::QueueFull)
            }
            Err(async_channel::TrySendError::Closed(_)) => {
                task.abort_submit();
                Err(PoolError::QueueClosed)
            }
        }
    }

    /// Submit a task, giving up if the queue stays full for `timeout`
    pub async fn add_task_timeout(&self, task: &Task, timeout: Duration) -> Result<(), PoolError> {
        let sender = self.sender()?;
        task.begin_submit()?;

        match tokio::time::timeout(timeout, sender.send(task.clone())).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                task.abort_submit();
                Err(PoolError::QueueClosed)
            }
            Err(_) => {
                task.abort_submit();
                Err(PoolError::SubmitTimeout(timeout))
            }
        }
    }

    /// Shut the pool down
    ///
    /// Idempotent: a pool already shutting down or shut down is left alone.
    /// See [`ShutdownMode`] for what happens to queued tasks. Soft shutdown
    /// escalates to hard after `shutdown_timeout`; hard shutdown waits for
    /// every worker to finish its current task and terminate.
    #[instrument(skip(self), fields(pool = %self.name, pool_id = self.id))]
    pub async fn stop(&self, mode: ShutdownMode) -> Result<(), PoolError> {
        let (queue_tx, queue_rx, workers, background) = {
            let mut inner = self.inner.write();
            if inner.state.is_stopping() {
                debug!(state = %inner.state, "Pool already stopping");
                return Ok(());
            }
            info!(%mode, from = %inner.state, "Shutting down pool");
            inner.state = PoolState::ShuttingDown;
            (
                inner.queue_tx.clone(),
                inner.queue_rx.clone(),
                inner.workers.values().cloned().collect::<Vec<_>>(),
                inner.background,
            )
        };

        // Workers are signalled before the queue closes so none of them
        // picks up a queued task after a hard stop.
        if mode == ShutdownMode::Hard {
            self.signal_workers(&workers);
        }
        if background {
            if let Some(tx) = &queue_tx {
                tx.close();
            }
        }

        let mut hard = mode == ShutdownMode::Hard;
        if mode == ShutdownMode::Soft {
            let deadline = Instant::now() + self.config.shutdown_timeout;
            if !self.wait_for_workers(&workers, Some(deadline)).await {
                warn!(
                    timeout = ?self.config.shutdown_timeout,
                    "Soft shutdown timed out, escalating to hard"
                );
                self.signal_workers(&workers);
                hard = true;
            }
        }

        if hard {
            if let Some(rx) = &queue_rx {
                let stopped = self.drain(rx);
                if stopped > 0 {
                    info!(stopped, "Discarded queued tasks");
                }
            }
            self.wait_for_workers(&workers, None).await;
        }

        // A worker retired after a fault leaves its share of the queue behind.
        if mode != ShutdownMode::Light {
            if let Some(rx) = &queue_rx {
                let stranded = self.drain(rx);
                if stranded > 0 {
                    warn!(stranded, "Stopped tasks left behind by faulted workers");
                }
            }
        }

        let mut inner = self.inner.write();
        if mode != ShutdownMode::Light {
            if let Some(scope) = &inner.scope {
                scope.cancel();
            }
        }
        inner.fault_tx = None;
        inner.state = PoolState::Shutdown;
        inner.stop_signal.cancel();
        info!("Pool shut down");

        Ok(())
    }

    /// Build the queue, fault channel and worker set; caller holds the lock
    ///
    /// Workers are returned unstarted. The caller spawns them with
    /// [`spawn_workers`](Self::spawn_workers) once the pool lock is released.
    fn start_workers(
        &self,
        inner: &mut PoolInner,
        runtime: &Handle,
    ) -> (mpsc::Receiver<WorkerFault>, Vec<Arc<Worker>>) {
        let scope = self.parent.child_token();
        let (queue_tx, queue_rx) = async_channel::bounded(self.config.task_queue_size);
        let (fault_tx, fault_rx) = mpsc::channel(self.config.worker_concurrency);

        for worker_id in 1..=self.config.worker_concurrency {
            let worker = Arc::new(Worker::new(
                worker_id,
                queue_rx.clone(),
                scope.clone(),
                fault_tx.clone(),
                Arc::clone(&self.metrics),
            ));
            inner.workers.insert(worker_id, worker);
        }

        inner.runtime = Some(runtime.clone());
        inner.scope = Some(scope);
        inner.queue_tx = Some(queue_tx);
        inner.queue_rx = Some(queue_rx);
        inner.fault_tx = Some(fault_tx);
        (fault_rx, inner.workers.values().cloned().collect())
    }

    fn spawn_workers(&self, workers: &[Arc<Worker>], runtime: &Handle) {
        for worker in workers {
            worker.spawn(runtime);
        }
    }

    fn signal_workers(&self, workers: &[Arc<Worker>]) {
        let signalled = workers.iter().filter(|w| w.stop()).count();
        debug!(signalled, "Signalled workers to stop");
    }

    fn sender(&self) -> Result<async_channel::Sender<Task>, PoolError> {
        let inner = self.inner.read();
        if inner.state != PoolState::BgRunning {
            return Err(PoolError::InvalidState {
                state: inner.state,
                expected: "bg_running",
            });
        }
        inner.queue_tx.clone().ok_or(PoolError::QueueClosed)
    }

    /// Stop every task still sitting in the queue; returns how many
    fn drain(&self, queue: &async_channel::Receiver<Task>) -> usize {
        let mut stopped = 0;
        while let Ok(task) = queue.try_recv() {
            if task.finish_stopped() {
                self.metrics
                    .task_finished(TaskState::TerminatedStopSignal, Duration::ZERO);
                stopped += 1;
            }
        }
        stopped
    }

    /// Poll until every worker is terminated, or until `deadline`
    async fn wait_for_workers(&self, workers: &[Arc<Worker>], deadline: Option<Instant>) -> bool {
        loop {
            let mut running = 0;
            for worker in workers {
                if worker.state() == WorkerState::RecoverErr {
                    worker.retire();
                }
                if worker.state() != WorkerState::Terminated {
                    running += 1;
                }
            }

            if running == 0 {
                debug!("All workers terminated");
                return true;
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(running, "Workers still running at deadline");
                return false;
            }

            tokio::time::sleep(self.config.worker_poll_interval).await;
        }
    }

    /// Respawn a faulted worker; false if it could not be restarted
    fn restart(&self, worker: &Arc<Worker>, worker_id: usize, runtime: &Handle) -> bool {
        if worker.spawn(runtime).is_none() {
            return false;
        }
        self.metrics.worker_respawned(worker_id);
        info!(worker_id, "Restarted faulted worker");
        true
    }

    /// Foreground runs never escalate: restart when allowed, otherwise retire
    fn recover_foreground(&self, fault: &WorkerFault, runtime: &Handle) {
        warn!(worker_id = fault.worker_id, "Worker faulted during foreground run");
        let worker = self.inner.read().workers.get(&fault.worker_id).cloned();
        let Some(worker) = worker else {
            return;
        };
        if !(self.config.respawn_on_fault && self.restart(&worker, fault.worker_id, runtime)) {
            worker.retire();
        }
    }

    /// Fault aggregation loop of a background pool
    async fn aggregate(
        self: Arc<Self>,
        mut faults: mpsc::Receiver<WorkerFault>,
        stop_signal: CancellationToken,
    ) -> Result<(), PoolError> {
        loop {
            tokio::select! {
                fault = faults.recv() => match fault {
                    Some(fault) => self.handle_fault(fault).await?,
                    None => {
                        debug!("Fault channel closed");
                        return Ok(());
                    }
                },
                _ = stop_signal.cancelled() => {
                    debug!("Aggregation loop: stop requested");
                    self.settle().await;
                    return Ok(());
                }
                _ = self.parent.cancelled() => {
                    warn!("Parent scope cancelled, forcing hard shutdown");
                    return self.stop(ShutdownMode::Hard).await;
                }
            }
        }
    }

    /// Wait out workers still draining after a light stop
    ///
    /// Workers that fault are retired, and once none is left whatever they
    /// stranded in the queue ends stopped.
    async fn settle(&self) {
        let (workers, queue_rx) = {
            let inner = self.inner.read();
            (
                inner.workers.values().cloned().collect::<Vec<_>>(),
                inner.queue_rx.clone(),
            )
        };

        self.wait_for_workers(&workers, None).await;
        if let Some(rx) = &queue_rx {
            let stranded = self.drain(rx);
            if stranded > 0 {
                warn!(stranded, "Stopped tasks left behind by faulted workers");
            }
        }
    }

    /// Restart the faulted worker, or escalate the fault to the pool
    async fn handle_fault(&self, fault: WorkerFault) -> Result<(), PoolError> {
        let (worker, runtime, running) = {
            let inner = self.inner.read();
            (
                inner.workers.get(&fault.worker_id).cloned(),
                inner.runtime.clone(),
                inner.state == PoolState::BgRunning,
            )
        };

        let Some(worker) = worker else {
            warn!(worker_id = fault.worker_id, "Fault from unknown worker");
            return Ok(());
        };

        if !running {
            worker.retire();
            return Ok(());
        }

        if self.config.respawn_on_fault {
            if !runtime.is_some_and(|runtime| self.restart(&worker, fault.worker_id, &runtime)) {
                worker.retire();
            }
            return Ok(());
        }

        {
            let mut inner = self.inner.write();
            if inner.state != PoolState::BgRunning {
                drop(inner);
                worker.retire();
                return Ok(());
            }
            inner.state = PoolState::RecoverErr;
        }
        error!(
            worker_id = fault.worker_id,
            "Worker fault escalated, forcing hard shutdown"
        );
        worker.retire();
        self.stop(ShutdownMode::Hard).await?;
        Err(PoolError::WorkerFault(fault))
    }
}
