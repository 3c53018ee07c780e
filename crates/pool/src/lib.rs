//! # Raytask Worker Pool
//!
//! Bounded worker pool that drives the per-pixel and per-tile jobs of the
//! raytask renderer.
//!
//! ## Features
//!
//! - **Opaque tasks**: a task is a work function plus JSON arguments; the pool never looks inside
//! - **Backpressure**: submission waits on a bounded queue, with non-blocking and timed variants
//! - **Three shutdown modes**: light, soft (finish queued work) and hard (discard it)
//! - **Fault containment**: a panicking work function is caught and the worker restarted
//! - **Task recycling**: finished task records go back to a cache for reuse
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        WorkerPool                            │
//! │  (own scope, task cache, batch submission + barrier)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                           Pool                               │
//! │  (queue, lifecycle, shutdown, fault aggregation)             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Worker × N                           │
//! │  (dequeue, run work on the blocking pool, report faults)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use raytask_pool::prelude::*;
//! use serde_json::json;
//!
//! # async fn render() -> Result<(), PoolError> {
//! let pool = WorkerPool::new(None, 1, "render", PoolConfig::from_env());
//! pool.start()?;
//!
//! let tasks = (0..64)
//!     .map(|pixel| {
//!         pool.task(
//!             format!("pixel-{pixel}"),
//!             |_outer, _inner, args| TaskOutput::ok(args.to_vec()),
//!             vec![json!(pixel)],
//!         )
//!     })
//!     .collect::<Result<Vec<_>, _>>()?;
//!
//! let summary = pool.submit_batch(&tasks).await?;
//! assert_eq!(summary.succeeded, 64);
//!
//! pool.shutdown_hard().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod task;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::PoolConfig;
    pub use crate::error::{PoolError, TaskError, WorkerFault};
    pub use crate::metrics::{AtomicPoolMetrics, MetricsSnapshot, PoolMetrics};
    pub use crate::task::{CompletionBarrier, Task, TaskCache, TaskOutput, TaskState};
    pub use crate::worker::{
        Pool, PoolState, RunSummary, ShutdownMode, WorkerPool, WorkerState,
    };
    pub use tokio_util::sync::CancellationToken;
}

// Re-export key types at crate root
pub use config::PoolConfig;
pub use error::{PoolError, TaskError, WorkerFault};
pub use metrics::{AtomicPoolMetrics, MetricsSnapshot, NoopMetrics, PoolMetrics};
pub use task::{CompletionBarrier, Task, TaskCache, TaskOutput, TaskSnapshot, TaskState, WorkFn};
pub use worker::{
    Pool, PoolState, RunSummary, ShutdownMode, Worker, WorkerPool, WorkerSnapshot, WorkerState,
};
