//! Error types for the pool, its workers and its tasks

use std::time::Duration;

use uuid::Uuid;

use crate::task::TaskState;
use crate::worker::PoolState;

/// Pool errors
///
/// Every variant is reported synchronously to the caller; the operation that
/// produced it has not changed any state.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Operation requested while the pool is in an incompatible state
    #[error("pool is in state {state}, operation requires {expected}")]
    InvalidState {
        state: PoolState,
        expected: &'static str,
    },

    /// Task cannot be submitted or reconfigured from its current state
    #[error("task {task_id} is in state {state}")]
    TaskNotReady { task_id: Uuid, state: TaskState },

    /// Bounded queue is at capacity (non-blocking submission only)
    #[error("task queue is full")]
    QueueFull,

    /// Queue was closed by a shutdown
    #[error("task queue is closed")]
    QueueClosed,

    /// Submission did not find room in the queue in time
    #[error("task submission timed out after {0:?}")]
    SubmitTimeout(Duration),

    /// No Tokio runtime to spawn workers on
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),

    /// A worker fault was escalated to the pool
    #[error(transparent)]
    WorkerFault(#[from] WorkerFault),

    /// Batch submission stopped early
    #[error("batch aborted after {submitted} of {total} tasks: {source}")]
    BatchAborted {
        submitted: usize,
        total: usize,
        #[source]
        source: Box<PoolError>,
    },
}

/// Error stored on a task after execution
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// Error reported by the work function itself
    #[error(transparent)]
    Work(anyhow::Error),

    /// Work function panicked
    #[error("work function panicked: {0}")]
    Panicked(String),

    /// Work function outlived its cooperative timeout
    #[error("task timed out after {0:?}")]
    TimedOut(Duration),
}

/// Fatal fault caught at a worker boundary
#[derive(Debug, Clone, thiserror::Error)]
#[error("worker {worker_id} fault: {message}")]
pub struct WorkerFault {
    /// Worker that faulted
    pub worker_id: usize,
    /// Task being processed when the fault happened
    pub task_id: Option<Uuid>,
    /// Fault description
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_state_message() {
        let err = PoolError::InvalidState {
            state: PoolState::New,
            expected: "bg_running",
        };
        assert_eq!(
            err.to_string(),
            "pool is in state new, operation requires bg_running"
        );
    }

    #[test]
    fn test_worker_fault_converts_into_pool_error() {
        let fault = WorkerFault {
            worker_id: 3,
            task_id: None,
            message: "boom".into(),
        };
        let err: PoolError = fault.into();
        assert_eq!(err.to_string(), "worker 3 fault: boom");
    }

    #[test]
    fn test_batch_aborted_keeps_source() {
        let err = PoolError::BatchAborted {
            submitted: 2,
            total: 5,
            source: Box::new(PoolError::QueueClosed),
        };
        assert!(err.to_string().contains("2 of 5"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
