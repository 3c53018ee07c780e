//! Workers, the pool that owns them, and the batch facade
//!
//! ```text
//!                    ┌──────────────────────── Pool ────────────────────────┐
//!  add_task ───────► │  bounded MPMC queue ──► Worker 1 ─┐                  │
//!  try_add_task      │          │          ──► Worker 2 ─┼─► fault channel  │
//!  add_task_timeout  │          │          ──► Worker N ─┘        │         │
//!                    │          ▼                                 ▼         │
//!  stop(mode) ─────► │   drain on hard stop            aggregation loop     │
//!                    │                                 (respawn / escalate) │
//!                    └──────────────────────────────────────────────────────┘
//! ```
//!
//! Cancellation runs top down: the caller's scope, then the pool-wide scope
//! (cancelled at shutdown), then each task's inner scope. Each worker also
//! has a private stop signal used by hard shutdown.

mod facade;
mod pool;
mod runner;
mod state;

pub use facade::WorkerPool;
pub use pool::{Pool, RunSummary};
pub use runner::{Worker, WorkerSnapshot};
pub use state::{PoolState, ShutdownMode, WorkerState};
