//! State shared by every transaction kind.

use super::lock::{LockContext, TransactionOutcome};
use super::manager::TransactionManager;
use super::state::{AbortReason, TransactionState, TransactionStateMachine};
use crate::config::TransactionConfig;
use crate::error::{CoreError, CoreResult};
use crate::types::{Lsn, TransactionId};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// Identity, state machine, lock contexts and manager back-reference.
pub(crate) struct TransactionBase {
    id: TransactionId,
    pub(crate) state: TransactionStateMachine,
    lock_contexts: Mutex<Vec<Arc<dyn LockContext>>>,
    manager: Weak<dyn TransactionManager>,
    pub(crate) config: TransactionConfig,
    commit_lsn: Mutex<Lsn>,
}

impl TransactionBase {
    pub(crate) fn new(
        id: TransactionId,
        manager: Weak<dyn TransactionManager>,
        config: TransactionConfig,
    ) -> Self {
        Self {
            id,
            state: TransactionStateMachine::new(id),
            lock_contexts: Mutex::new(Vec::new()),
            manager,
            config,
            commit_lsn: Mutex::new(Lsn::INVALID),
        }
    }

    pub(crate) fn id(&self) -> TransactionId {
        self.id
    }

    pub(crate) fn state(&self) -> TransactionState {
        self.state.state()
    }

    pub(crate) fn abort_reason(&self) -> AbortReason {
        self.state.abort_reason()
    }

    /// Resolves the manager, or `ObjectClosed` if it has been dropped.
    pub(crate) fn manager(&self) -> CoreResult<Arc<dyn TransactionManager>> {
        self.manager.upgrade().ok_or(CoreError::ObjectClosed)
    }

    pub(crate) fn commit_sequence_number(&self) -> Lsn {
        *self.commit_lsn.lock()
    }

    /// Records the commit LSN.
    ///
    /// # Panics
    ///
    /// Panics if `lsn` is not positive or a commit LSN was already assigned.
    pub(crate) fn set_commit_sequence_number(&self, lsn: Lsn) {
        assert!(lsn.as_i64() > 0, "{} commit lsn must be positive, got {lsn}", self.id);
        let mut commit_lsn = self.commit_lsn.lock();
        assert_eq!(
            *commit_lsn,
            Lsn::INVALID,
            "{} commit lsn assigned twice",
            self.id
        );
        *commit_lsn = lsn;
    }

    pub(crate) fn add_lock_context(&self, context: Arc<dyn LockContext>) {
        self.lock_contexts.lock().push(context);
    }

    pub(crate) fn lock_context_count(&self) -> usize {
        self.lock_contexts.lock().len()
    }

    /// Unlocks every held non-tracking context once and forgets all contexts.
    pub(crate) fn release_lock_contexts(&self, outcome: TransactionOutcome) {
        let contexts = std::mem::take(&mut *self.lock_contexts.lock());
        for context in contexts {
            if !context.is_tracking_context() {
                context.unlock(outcome);
            }
        }
    }
}
