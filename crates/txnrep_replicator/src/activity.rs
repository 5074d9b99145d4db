//! Service activity gate.
//!
//! Public replicator calls hold an [`ActivityToken`] for their duration.
//! Once close starts, new tokens are refused with `ObjectClosed` and close
//! waits for the outstanding ones to drain.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use txnrep_core::{CoreError, CoreResult};

/// Lifecycle phase of the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityPhase {
    /// Not opened yet.
    Created,
    /// Accepting calls.
    Open,
    /// Close started; draining.
    Closing,
    /// Closed.
    Closed,
}

/// Counts in-flight calls and refuses new ones once closing.
#[derive(Debug)]
pub struct ServiceActivity {
    phase: Mutex<ActivityPhase>,
    active: AtomicUsize,
    drained: Notify,
}

/// Proof that a call is in flight. Released on drop.
#[derive(Debug)]
pub struct ActivityToken<'a> {
    activity: &'a ServiceActivity,
}

impl Drop for ActivityToken<'_> {
    fn drop(&mut self) {
        if self.activity.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.activity.drained.notify_waiters();
        }
    }
}

impl ServiceActivity {
    /// Creates a gate in [`ActivityPhase::Created`].
    pub fn new() -> Self {
        Self {
            phase: Mutex::new(ActivityPhase::Created),
            active: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> ActivityPhase {
        *self.phase.lock()
    }

    /// Number of calls in flight.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Starts accepting calls.
    pub fn open(&self) -> CoreResult<()> {
        let mut phase = self.phase.lock();
        if *phase != ActivityPhase::Created {
            return Err(CoreError::invalid_operation(format!(
                "cannot open from {:?}",
                *phase
            )));
        }
        *phase = ActivityPhase::Open;
        Ok(())
    }

    /// Admits one call, or fails with `ObjectClosed` unless open.
    pub fn try_acquire(&self) -> CoreResult<ActivityToken<'_>> {
        let phase = self.phase.lock();
        if *phase != ActivityPhase::Open {
            return Err(CoreError::ObjectClosed);
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(ActivityToken { activity: self })
    }

    /// Stops admitting calls. Returns false if close already started.
    pub fn begin_close(&self) -> bool {
        let mut phase = self.phase.lock();
        match *phase {
            ActivityPhase::Created | ActivityPhase::Open => {
                *phase = ActivityPhase::Closing;
                true
            }
            ActivityPhase::Closing | ActivityPhase::Closed => false,
        }
    }

    /// Waits until no call is in flight or `timeout` elapses.
    ///
    /// Returns false on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.active.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }

    /// Marks the gate closed.
    pub fn mark_closed(&self) {
        *self.phase.lock() = ActivityPhase::Closed;
    }
}

impl Default for ServiceActivity {
    fn default() -> Self {
        Self::new()
    }
}
