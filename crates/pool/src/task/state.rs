//! Task lifecycle states

use serde::{Deserialize, Serialize};

/// Task lifecycle state
///
/// # State Machine
///
/// ```text
/// Fresh ──┐
///         ├─ configure ─► Ready ─► Queued ─► InProgress ─► DoneSuccess
/// Acquired┘                 │        │           ├───────► RecoverErr
///    ▲                      │        │           └───────► TerminatedTimeout
///    │                      └────────┴─ stop ────────────► TerminatedStopSignal
///    │                               └─ scope cancelled ─► TerminatedCtxClosed
///    │
/// ReturnedToCache ◄─ release (from Fresh, Acquired, DoneSuccess)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Newly allocated, never configured
    Fresh,
    /// Handed out again by the cache
    Acquired,
    /// Sitting in the cache
    ReturnedToCache,
    /// Configured and ready for submission
    Ready,
    /// Waiting in a pool queue
    Queued,
    /// Work function running on a worker
    InProgress,
    /// Work function returned (its own error, if any, is data)
    DoneSuccess,
    /// Work function panicked
    RecoverErr,
    /// Stopped before it started
    TerminatedStopSignal,
    /// Outer scope was cancelled before it started
    TerminatedCtxClosed,
    /// Work function outlived its cooperative timeout
    TerminatedTimeout,
}

impl TaskState {
    /// True once the task will never run (again) in this configuration cycle
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::DoneSuccess
                | Self::RecoverErr
                | Self::TerminatedStopSignal
                | Self::TerminatedCtxClosed
                | Self::TerminatedTimeout
        )
    }

    /// True if the cache may take the task back from this state
    pub fn is_reusable(&self) -> bool {
        matches!(
            self,
            Self::Fresh | Self::Acquired | Self::DoneSuccess | Self::ReturnedToCache
        )
    }

    /// True while a worker may still pick the task up
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Ready | Self::Queued)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fresh => write!(f, "fresh"),
            Self::Acquired => write!(f, "acquired"),
            Self::ReturnedToCache => write!(f, "returned_to_cache"),
            Self::Ready => write!(f, "ready"),
            Self::Queued => write!(f, "queued"),
            Self::InProgress => write!(f, "in_progress"),
            Self::DoneSuccess => write!(f, "done_success"),
            Self::RecoverErr => write!(f, "recover_err"),
            Self::TerminatedStopSignal => write!(f, "terminated_stop_signal"),
            Self::TerminatedCtxClosed => write!(f, "terminated_ctx_closed"),
            Self::TerminatedTimeout => write!(f, "terminated_timeout"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(TaskState::DoneSuccess.is_terminal());
        assert!(TaskState::TerminatedStopSignal.is_terminal());
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::ReturnedToCache.is_terminal());
    }

    #[test]
    fn test_stopped_tasks_are_not_reusable() {
        assert!(TaskState::DoneSuccess.is_reusable());
        assert!(TaskState::Fresh.is_reusable());
        assert!(!TaskState::TerminatedStopSignal.is_reusable());
        assert!(!TaskState::RecoverErr.is_reusable());
        assert!(!TaskState::InProgress.is_reusable());
    }

    #[test]
    fn test_serde_matches_display() {
        let json = serde_json::to_string(&TaskState::TerminatedCtxClosed).unwrap();
        assert_eq!(json, format!("\"{}\"", TaskState::TerminatedCtxClosed));
    }
}
