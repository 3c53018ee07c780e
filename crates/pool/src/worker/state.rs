//! Pool and worker lifecycle states

use serde::{Deserialize, Serialize};

/// Pool lifecycle state
///
/// # State Machine
///
/// ```text
/// Background:  New ─► BgRunning ─► ShuttingDown ─► Shutdown
///                          │                          ▲
///                          └──► RecoverErr ───────────┘ (forced hard shutdown)
///
/// Foreground:  New ─► OnlineRunning ─► OnlineDone | IncompleteDone ─► Shutdown
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    /// Created, nothing started
    New,
    /// Running a foreground batch
    OnlineRunning,
    /// Foreground batch finished, every task succeeded
    OnlineDone,
    /// Foreground batch finished with stopped, panicked or timed out tasks
    IncompleteDone,
    /// Internal fault caught, heading for a forced shutdown
    RecoverErr,
    /// Running in the background, accepting tasks
    BgRunning,
    /// Shutdown in progress
    ShuttingDown,
    /// Terminal
    Shutdown,
}

impl PoolState {
    /// True once a shutdown has started or finished
    pub fn is_stopping(&self) -> bool {
        matches!(self, Self::ShuttingDown | Self::Shutdown)
    }
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::OnlineRunning => write!(f, "online_running"),
            Self::OnlineDone => write!(f, "online_done"),
            Self::IncompleteDone => write!(f, "incomplete_done"),
            Self::RecoverErr => write!(f, "recover_err"),
            Self::BgRunning => write!(f, "bg_running"),
            Self::ShuttingDown => write!(f, "shutting_down"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Worker lifecycle state
///
/// # State Machine
///
/// ```text
/// New ─► Idle ◄──► Working ─► RecoverErr ─► Idle (loop restarted)
///         │                       └───────► Terminated (retired)
///         ├─► TerminatingQueueClosed ─────┐
///         ├─► TerminatingStopSignal ──────┼─► Terminated
///         └─► TerminatingParentCancelled ─┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    New,
    Idle,
    Working,
    TerminatingQueueClosed,
    TerminatingStopSignal,
    TerminatingParentCancelled,
    Terminated,
    RecoverErr,
}

impl WorkerState {
    /// States from which a stop request still has an effect
    pub fn accepts_stop(&self) -> bool {
        matches!(self, Self::New | Self::Idle | Self::Working)
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Idle => write!(f, "idle"),
            Self::Working => write!(f, "working"),
            Self::TerminatingQueueClosed => write!(f, "terminating_queue_closed"),
            Self::TerminatingStopSignal => write!(f, "terminating_stop_signal"),
            Self::TerminatingParentCancelled => write!(f, "terminating_parent_cancelled"),
            Self::Terminated => write!(f, "terminated"),
            Self::RecoverErr => write!(f, "recover_err"),
        }
    }
}

/// How [`Pool::stop`](super::Pool::stop) treats queued work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    /// Transition state and close the queue; leave workers alone
    Light,
    /// Let workers finish everything already queued
    Soft,
    /// Discard queued tasks and stop workers as soon as they are free
    #[default]
    Hard,
}

impl std::fmt::Display for ShutdownMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Light => write!(f, "light"),
            Self::Soft => write!(f, "soft"),
            Self::Hard => write!(f, "hard"),
        }
    }
}

impl std::str::FromStr for ShutdownMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "light" => Ok(Self::Light),
            "soft" => Ok(Self::Soft),
            "hard" => Ok(Self::Hard),
            other => Err(format!("unknown shutdown mode: {other}")),
        }
    }
}
