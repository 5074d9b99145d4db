//! One-shot broadcast completion.
//!
//! A [`CompletionTask`] completes exactly once with a status and wakes every
//! waiter. The waker channel is only created if somebody starts waiting
//! before completion; waiters that arrive afterwards read the stored status
//! directly.

use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use tokio::sync::watch;

type Slot = Option<CoreResult<()>>;

#[derive(Default)]
struct CompletionState {
    status: Slot,
    waiters: Option<watch::Sender<Slot>>,
}

/// Single-result, multi-waiter broadcast future.
#[derive(Default)]
pub struct CompletionTask {
    state: Mutex<CompletionState>,
}

impl CompletionTask {
    /// Creates an incomplete task.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a task that is already completed with `status`.
    pub fn completed(status: CoreResult<()>) -> Self {
        let task = Self::new();
        task.complete_awaiters(status);
        task
    }

    /// Returns true once [`complete_awaiters`](Self::complete_awaiters) has run.
    pub fn is_completed(&self) -> bool {
        self.state.lock().status.is_some()
    }

    /// Returns true if a waiter arrived before completion.
    pub fn has_waiters(&self) -> bool {
        self.state.lock().waiters.is_some()
    }

    /// Completes the task and wakes all waiters.
    ///
    /// # Panics
    ///
    /// Panics if the task was already completed. Completing twice is a
    /// contract violation by the caller.
    pub fn complete_awaiters(&self, status: CoreResult<()>) {
        let mut state = self.state.lock();
        assert!(
            state.status.is_none(),
            "completion task completed more than once"
        );
        state.status = Some(status.clone());
        if let Some(sender) = state.waiters.as_ref() {
            sender.send_replace(Some(status));
        }
    }

    /// Waits for completion and returns the stored status.
    pub async fn await_completion(&self) -> CoreResult<()> {
        let mut receiver = {
            let mut state = self.state.lock();
            if let Some(status) = state.status.as_ref() {
                return status.clone();
            }
            state
                .waiters
                .get_or_insert_with(|| watch::channel(None).0)
                .subscribe()
        };

        let status = receiver
            .wait_for(Option::is_some)
            .await
            .map_err(|_| CoreError::unexpected("completion task dropped before completing"))?;
        match &*status {
            Some(status) => status.clone(),
            None => Err(CoreError::unexpected("completion task woke without a status")),
        }
    }
}

impl std::fmt::Debug for CompletionTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CompletionTask")
            .field("status", &state.status)
            .field("has_waiters", &state.waiters.is_some())
            .finish()
    }
}
