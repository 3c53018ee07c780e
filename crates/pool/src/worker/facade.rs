//! Batch-oriented front end over [`Pool`]

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::pool::{Pool, RunSummary};
use super::state::ShutdownMode;
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::metrics::{self, PoolMetrics};
use crate::task::{CompletionBarrier, Task, TaskCache, TaskOutput};

/// Background pool with its own scope, task cache and batch submission
///
/// The facade's scope is a child of the caller's, so cancelling the caller
/// tears the pool down, while [`shutdown`](Self::shutdown) only cancels what
/// the facade owns.
pub struct WorkerPool {
    scope: CancellationToken,
    pool: Arc<Pool>,
    cache: TaskCache,
    aggregation: Mutex<Option<JoinHandle<Result<(), PoolError>>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("pool", &self.pool)
            .field("cache", &self.cache)
            .finish()
    }
}

impl WorkerPool {
    /// Build a facade; `parent` defaults to a fresh root scope
    pub fn new(
        parent: Option<&CancellationToken>,
        id: u64,
        name: impl Into<String>,
        config: PoolConfig,
    ) -> Self {
        Self::with_metrics(parent, id, name, config, metrics::noop())
    }

    /// Build a facade whose pool and cache report to `metrics`
    pub fn with_metrics(
        parent: Option<&CancellationToken>,
        id: u64,
        name: impl Into<String>,
        config: PoolConfig,
        metrics: Arc<dyn PoolMetrics>,
    ) -> Self {
        let scope = match parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let pool = Pool::new(&scope, id, name, config).with_metrics(Arc::clone(&metrics));

        Self {
            scope,
            pool: Arc::new(pool),
            cache: TaskCache::with_metrics(metrics),
            aggregation: Mutex::new(None),
        }
    }

    /// Scope under which [`task`](Self::task) configures work
    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    pub fn cache(&self) -> &TaskCache {
        &self.cache
    }

    /// Start the pool in the background
    pub fn start(&self) -> Result<(), PoolError> {
        let handle = self.pool.run_background()?;
        *self.aggregation.lock() = Some(handle);
        Ok(())
    }

    /// Build a ready task from the cache under the facade's scope
    pub fn task<F>(&self, name: impl Into<String>, work: F, args: Vec<Value>) -> Result<Task, PoolError>
    where
        F: Fn(&CancellationToken, &CancellationToken, &[Value]) -> TaskOutput
            + Send
            + Sync
            + 'static,
    {
        self.cache.task(&self.scope, name, work, args)
    }

    /// Hand a finished task back to the cache
    pub fn recycle(&self, task: Task) -> bool {
        self.cache.release(task)
    }

    pub async fn add_task(&self, task: &Task) -> Result<(), PoolError> {
        self.pool.add_task(task).await
    }

    /// Submit every task and wait until all submitted ones are terminal
    ///
    /// A failed submission aborts the batch: the remaining tasks are not
    /// submitted, the ones already queued still run, and the error is
    /// returned once they are done.
    #[instrument(skip(self, tasks), fields(pool = %self.pool.name(), tasks = tasks.len()))]
    pub async fn submit_batch(&self, tasks: &[Task]) -> Result<RunSummary, PoolError> {
        let started = std::time::Instant::now();
        let barrier = Arc::new(CompletionBarrier::new());

        let mut failure = None;
        for (submitted, task) in tasks.iter().enumerate() {
            if let Err(e) = self.pool.add_task_to_barrier(task, &barrier).await {
                warn!(submitted, "Batch submission aborted: {}", e);
                failure = Some(PoolError::BatchAborted {
                    submitted,
                    total: tasks.len(),
                    source: Box::new(e),
                });
                break;
            }
        }

        barrier.wait().await;

        if let Some(e) = failure {
            return Err(e);
        }

        let mut summary = RunSummary::from_tasks(tasks);
        summary.elapsed = started.elapsed();
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Batch finished"
        );
        Ok(summary)
    }

    /// Stop the pool in hard mode
    pub async fn shutdown_hard(&self) -> Result<(), PoolError> {
        self.shutdown(ShutdownMode::Hard).await
    }

    /// Stop the pool, cancel the facade's scope and join the aggregation loop
    ///
    /// Returns the fault the loop escalated, if any.
    pub async fn shutdown(&self, mode: ShutdownMode) -> Result<(), PoolError> {
        self.pool.stop(mode).await?;
        self.scope.cancel();

        let handle = self.aggregation.lock().take();
        match handle {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => {
                    warn!("Aggregation loop did not finish cleanly: {}", e);
                    Ok(())
                }
            },
            None => Ok(()),
        }
    }
}
