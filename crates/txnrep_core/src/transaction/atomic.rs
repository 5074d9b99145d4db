//! Single-operation transactions.
//!
//! An atomic operation folds begin, one operation and commit into a single
//! call to the manager. A retriable failure returns the handle to `Active`
//! and hands the status back so the caller can retry the whole call.

use super::base::TransactionBase;
use super::lock::{LockContext, TransactionOutcome};
use super::manager::TransactionManager;
use super::state::TransactionState;
use crate::config::TransactionConfig;
use crate::error::CoreResult;
use crate::types::{Lsn, OperationData, StateProviderId, TransactionId};
use bytes::Bytes;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AtomicKind {
    Undoable,
    RedoOnly,
}

async fn run_atomic(
    base: &TransactionBase,
    kind: AtomicKind,
    state_provider_id: StateProviderId,
    operation: OperationData,
    lock_context: Option<Arc<dyn LockContext>>,
) -> CoreResult<Lsn> {
    let manager = base.manager()?;
    manager.error_if_state_provider_is_not_registered(state_provider_id, base.id())?;
    base.state.on_begin_commit()?;

    let result = match kind {
        AtomicKind::Undoable => {
            manager
                .add_atomic_operation(base.id(), state_provider_id, &operation)
                .await
        }
        AtomicKind::RedoOnly => {
            manager
                .add_atomic_redo_operation(base.id(), state_provider_id, &operation)
                .await
        }
    };

    match result {
        Ok(lsn) => {
            base.set_commit_sequence_number(lsn);
            if let Some(context) = lock_context {
                base.add_lock_context(context);
            }
            base.state.on_commit_successful();
            base.release_lock_contexts(TransactionOutcome::Committed(lsn));
            debug!(txn = %base.id(), %lsn, ?kind, "atomic operation committed");
            Ok(lsn)
        }
        Err(e) if e.is_retriable() => {
            debug!(txn = %base.id(), error = %e, "atomic operation may be retried");
            base.state.on_atomic_operation_retry();
            Err(e)
        }
        Err(e) => {
            warn!(txn = %base.id(), error = %e, "atomic operation faulted");
            base.state.on_commit_faulted();
            if let Some(context) = lock_context {
                manager.single_operation_transaction_abort_unlock(state_provider_id, context);
            }
            Err(e)
        }
    }
}

/// Atomic operation carrying undo information.
pub struct AtomicOperation {
    base: TransactionBase,
}

impl AtomicOperation {
    /// Creates an atomic operation. `id` must be negative.
    pub fn new(
        id: TransactionId,
        manager: Weak<dyn TransactionManager>,
        config: TransactionConfig,
    ) -> Self {
        debug_assert!(id.is_atomic_operation());
        Self {
            base: TransactionBase::new(id, manager, config),
        }
    }

    /// Returns the transaction ID.
    pub fn id(&self) -> TransactionId {
        self.base.id()
    }

    /// Returns the current state.
    pub fn state(&self) -> TransactionState {
        self.base.state()
    }

    /// Commit LSN, `Lsn::INVALID` until committed.
    pub fn commit_sequence_number(&self) -> Lsn {
        self.base.commit_sequence_number()
    }

    /// Logs and commits the operation. Returns the commit LSN.
    pub async fn add_operation(
        &self,
        state_provider_id: StateProviderId,
        operation: OperationData,
        lock_context: Option<Arc<dyn LockContext>>,
    ) -> CoreResult<Lsn> {
        run_atomic(
            &self.base,
            AtomicKind::Undoable,
            state_provider_id,
            operation,
            lock_context,
        )
        .await
    }

    /// Releases any lock context still held.
    pub fn dispose(&self) {
        self.base.release_lock_contexts(TransactionOutcome::Aborted);
    }
}

/// Atomic operation without undo information.
pub struct AtomicRedoOperation {
    base: TransactionBase,
}

impl AtomicRedoOperation {
    /// Creates a redo-only atomic operation. `id` must be negative.
    pub fn new(
        id: TransactionId,
        manager: Weak<dyn TransactionManager>,
        config: TransactionConfig,
    ) -> Self {
        debug_assert!(id.is_atomic_operation());
        Self {
            base: TransactionBase::new(id, manager, config),
        }
    }

    /// Returns the transaction ID.
    pub fn id(&self) -> TransactionId {
        self.base.id()
    }

    /// Returns the current state.
    pub fn state(&self) -> TransactionState {
        self.base.state()
    }

    /// Commit LSN, `Lsn::INVALID` until committed.
    pub fn commit_sequence_number(&self) -> Lsn {
        self.base.commit_sequence_number()
    }

    /// Logs and commits a redo-only operation. Returns the commit LSN.
    pub async fn add_operation(
        &self,
        state_provider_id: StateProviderId,
        metadata: Option<Bytes>,
        redo: Option<Bytes>,
        lock_context: Option<Arc<dyn LockContext>>,
    ) -> CoreResult<Lsn> {
        let operation = OperationData {
            metadata,
            undo: None,
            redo,
        };
        run_atomic(
            &self.base,
            AtomicKind::RedoOnly,
            state_provider_id,
            operation,
            lock_context,
        )
        .await
    }

    /// Releases any lock context still held.
    pub fn dispose(&self) {
        self.base.release_lock_contexts(TransactionOutcome::Aborted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::transaction::testing::{Call, RecordingLock, ScriptedManager};

    const SP: StateProviderId = StateProviderId(4);

    fn weak(manager: &Arc<ScriptedManager>) -> Weak<dyn TransactionManager> {
        Arc::downgrade(manager) as Weak<dyn TransactionManager>
    }

    fn atomic(manager: &Arc<ScriptedManager>) -> AtomicOperation {
        AtomicOperation::new(TransactionId::new(-5), weak(manager), TransactionConfig::default())
    }

    #[tokio::test]
    async fn single_round_trip_commit() {
        let manager = ScriptedManager::new();
        let op = atomic(&manager);
        let lock = RecordingLock::new();

        let lsn = op
            .add_operation(SP, OperationData::redo(vec![1]), Some(lock.clone()))
            .await
            .unwrap();

        assert_eq!(op.state(), TransactionState::Committed);
        assert_eq!(op.commit_sequence_number(), lsn);
        assert_eq!(manager.calls(), vec![Call::Atomic(op.id())]);
        assert_eq!(lock.releases(), vec![TransactionOutcome::Committed(lsn)]);
    }

    #[tokio::test]
    async fn second_operation_is_rejected() {
        let manager = ScriptedManager::new();
        let op = atomic(&manager);
        op.add_operation(SP, OperationData::redo(vec![1]), None)
            .await
            .unwrap();

        let again = op.add_operation(SP, OperationData::redo(vec![2]), None).await;
        assert_eq!(again, Err(CoreError::TransactionNotActive));
    }

    #[tokio::test]
    async fn retriable_failure_returns_to_active() {
        let manager = ScriptedManager::new();
        manager.fail_commits([CoreError::ReplicationQueueFull]);
        let op = atomic(&manager);

        let first = op.add_operation(SP, OperationData::redo(vec![1]), None).await;
        assert_eq!(first, Err(CoreError::ReplicationQueueFull));
        assert_eq!(op.state(), TransactionState::Active);

        op.add_operation(SP, OperationData::redo(vec![1]), None)
            .await
            .unwrap();
        assert_eq!(op.state(), TransactionState::Committed);
        assert_eq!(manager.count(|c| matches!(c, Call::Atomic(_))), 2);
    }

    #[tokio::test]
    async fn fatal_failure_faults_and_unlocks() {
        let manager = ScriptedManager::new();
        manager.fail_commits([CoreError::NotPrimary]);
        let op = atomic(&manager);
        let lock = RecordingLock::new();

        let result = op
            .add_operation(SP, OperationData::redo(vec![1]), Some(lock.clone()))
            .await;

        assert_eq!(result, Err(CoreError::NotPrimary));
        assert_eq!(op.state(), TransactionState::Faulted);
        assert_eq!(lock.releases(), vec![TransactionOutcome::Aborted]);
        assert!(manager.calls().contains(&Call::AbortUnlock(SP)));
    }

    #[tokio::test]
    async fn redo_operation_carries_no_undo() {
        let manager = ScriptedManager::new();
        let op = AtomicRedoOperation::new(
            TransactionId::new(-6),
            weak(&manager),
            TransactionConfig::default(),
        );

        op.add_operation(SP, Some(Bytes::from_static(b"m")), Some(Bytes::from_static(b"r")), None)
            .await
            .unwrap();

        assert_eq!(manager.calls(), vec![Call::AtomicRedo(op.id())]);
        op.dispose();
    }

    #[tokio::test]
    async fn closed_manager_leaves_state_untouched() {
        let manager = ScriptedManager::new();
        let op = atomic(&manager);
        drop(manager);

        let result = op.add_operation(SP, OperationData::redo(vec![1]), None).await;
        assert_eq!(result, Err(CoreError::ObjectClosed));
        assert_eq!(op.state(), TransactionState::Active);
    }
}
