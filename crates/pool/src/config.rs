//! Pool configuration
//!
//! Zero means "use the default" for both sizing knobs; nothing else is
//! validated.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Queue slots per worker when the queue size is left at zero
pub const QUEUE_SLOTS_PER_WORKER: usize = 1000;

/// Workers per hardware thread when the concurrency is left at zero
pub const WORKERS_PER_CPU: usize = 2;

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of workers (0 = twice the available parallelism)
    pub worker_concurrency: usize,

    /// Capacity of the shared task queue (0 = 1000 per worker)
    pub task_queue_size: usize,

    /// How long a soft shutdown waits for queued work before escalating
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,

    /// Interval at which shutdown polls worker states
    #[serde(with = "duration_millis")]
    pub worker_poll_interval: Duration,

    /// Restart a worker loop after a fault instead of failing the pool
    pub respawn_on_fault: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: 0,
            task_queue_size: 0,
            shutdown_timeout: Duration::from_secs(30),
            worker_poll_interval: Duration::from_millis(10),
            respawn_on_fault: true,
        }
    }
}

impl PoolConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `RAYTASK_WORKER_CONCURRENCY`: number of workers
    /// - `RAYTASK_QUEUE_SIZE`: task queue capacity
    /// - `RAYTASK_SHUTDOWN_TIMEOUT_MS`: soft shutdown timeout
    /// - `RAYTASK_RESPAWN_ON_FAULT`: "false" to fail the pool on a worker fault
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let worker_concurrency = std::env::var("RAYTASK_WORKER_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.worker_concurrency);

        let task_queue_size = std::env::var("RAYTASK_QUEUE_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.task_queue_size);

        let shutdown_timeout = std::env::var("RAYTASK_SHUTDOWN_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.shutdown_timeout);

        let respawn_on_fault = std::env::var("RAYTASK_RESPAWN_ON_FAULT")
            .map(|v| v.to_lowercase() != "false")
            .unwrap_or(defaults.respawn_on_fault);

        Self {
            worker_concurrency,
            task_queue_size,
            shutdown_timeout,
            respawn_on_fault,
            ..defaults
        }
    }

    /// Set the number of workers
    pub fn with_worker_concurrency(mut self, workers: usize) -> Self {
        self.worker_concurrency = workers;
        self
    }

    /// Set the task queue capacity
    pub fn with_task_queue_size(mut self, size: usize) -> Self {
        self.task_queue_size = size;
        self
    }

    /// Set the soft shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the worker state polling interval used during shutdown
    pub fn with_worker_poll_interval(mut self, interval: Duration) -> Self {
        self.worker_poll_interval = interval;
        self
    }

    /// Restart faulted workers (true) or escalate faults to the pool (false)
    pub fn with_respawn_on_fault(mut self, respawn: bool) -> Self {
        self.respawn_on_fault = respawn;
        self
    }

    /// Substitute defaults for zero-valued sizing fields
    pub fn resolved(mut self) -> Self {
        if self.worker_concurrency == 0 {
            let cpus = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);
            self.worker_concurrency = cpus * WORKERS_PER_CPU;
        }

        if self.task_queue_size == 0 {
            self.task_queue_size = self.worker_concurrency * QUEUE_SLOTS_PER_WORKER;
        }

        self
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
