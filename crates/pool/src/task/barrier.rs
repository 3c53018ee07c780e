//! Completion barrier shared by a batch of tasks

use std::time::Duration;

use tokio::sync::watch;

/// Counts outstanding tasks and releases waiters when the count hits zero
///
/// Every task registered with [`add`](Self::add) must be matched by exactly
/// one [`done`](Self::done); the pool calls `add` on submission and the task
/// calls `done` when it reaches a terminal state, whether it ran or not.
#[derive(Debug)]
pub struct CompletionBarrier {
    pending: watch::Sender<usize>,
}

impl Default for CompletionBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionBarrier {
    pub fn new() -> Self {
        Self {
            pending: watch::Sender::new(0),
        }
    }

    /// Register `count` more outstanding tasks
    pub fn add(&self, count: usize) {
        self.pending.send_modify(|pending| *pending += count);
    }

    /// Mark one outstanding task as finished
    pub fn done(&self) {
        self.pending
            .send_modify(|pending| *pending = pending.saturating_sub(1));
    }

    /// Number of tasks still outstanding
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Wait until no tasks are outstanding
    pub async fn wait(&self) {
        let mut rx = self.pending.subscribe();
        // The sender lives in `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|pending| *pending == 0).await;
    }

    /// Wait with a deadline; returns false if tasks were still outstanding
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}
