//! Scripted transaction manager for unit tests.

use super::lock::{LockContext, TransactionOutcome};
use super::manager::TransactionManager;
use crate::error::{CoreError, CoreResult};
use crate::types::{Lsn, OperationData, ReplicaRole, StateProviderId, TransactionId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Begin(TransactionId),
    BeginAsync(TransactionId),
    Add(TransactionId),
    Atomic(TransactionId),
    AtomicRedo(TransactionId),
    Commit(TransactionId),
    Abort(TransactionId),
    Register,
    Unregister(Lsn),
    AbortUnlock(StateProviderId),
}

#[derive(Default)]
pub(crate) struct ScriptedManager {
    next_lsn: AtomicI64,
    pub(crate) calls: Mutex<Vec<Call>>,
    pub(crate) commit_times: Mutex<Vec<Instant>>,
    commit_script: Mutex<VecDeque<CoreError>>,
    abort_script: Mutex<VecDeque<CoreError>>,
    begin_failure: Mutex<Option<CoreError>>,
    unregistered: Mutex<Vec<StateProviderId>>,
}

impl ScriptedManager {
    pub(crate) fn new() -> Arc<Self> {
        let manager = Self::default();
        manager.next_lsn.store(10, Ordering::SeqCst);
        Arc::new(manager)
    }

    /// Fails the next commit-like calls with `errors`, in order.
    pub(crate) fn fail_commits(&self, errors: impl IntoIterator<Item = CoreError>) {
        self.commit_script.lock().extend(errors);
    }

    pub(crate) fn fail_aborts(&self, errors: impl IntoIterator<Item = CoreError>) {
        self.abort_script.lock().extend(errors);
    }

    pub(crate) fn fail_next_begin(&self, error: CoreError) {
        *self.begin_failure.lock() = Some(error);
    }

    pub(crate) fn unregister_provider(&self, id: StateProviderId) {
        self.unregistered.lock().push(id);
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub(crate) fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| matches(c)).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn commit_like(&self) -> CoreResult<Lsn> {
        self.commit_times.lock().push(Instant::now());
        match self.commit_script.lock().pop_front() {
            Some(error) => Err(error),
            None => Ok(Lsn::new(self.next_lsn.fetch_add(1, Ordering::SeqCst))),
        }
    }
}

#[async_trait]
impl TransactionManager for ScriptedManager {
    fn role(&self) -> ReplicaRole {
        ReplicaRole::Primary
    }

    fn begin_transaction(
        &self,
        txn: TransactionId,
        _state_provider_id: StateProviderId,
        _operation: &OperationData,
    ) -> CoreResult<()> {
        self.record(Call::Begin(txn));
        match self.begin_failure.lock().take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn begin_transaction_async(
        &self,
        txn: TransactionId,
        _state_provider_id: StateProviderId,
        _operation: &OperationData,
    ) -> CoreResult<Lsn> {
        self.record(Call::BeginAsync(txn));
        self.commit_like()
    }

    fn add_operation(
        &self,
        txn: TransactionId,
        _state_provider_id: StateProviderId,
        _operation: &OperationData,
    ) -> CoreResult<()> {
        self.record(Call::Add(txn));
        Ok(())
    }

    async fn add_atomic_operation(
        &self,
        txn: TransactionId,
        _state_provider_id: StateProviderId,
        _operation: &OperationData,
    ) -> CoreResult<Lsn> {
        self.record(Call::Atomic(txn));
        self.commit_like()
    }

    async fn add_atomic_redo_operation(
        &self,
        txn: TransactionId,
        _state_provider_id: StateProviderId,
        operation: &OperationData,
    ) -> CoreResult<Lsn> {
        assert!(operation.undo.is_none());
        self.record(Call::AtomicRedo(txn));
        self.commit_like()
    }

    async fn commit_transaction(&self, txn: TransactionId) -> CoreResult<Lsn> {
        self.record(Call::Commit(txn));
        self.commit_like()
    }

    async fn abort_transaction(&self, txn: TransactionId) -> CoreResult<Lsn> {
        self.record(Call::Abort(txn));
        let scripted = self.abort_script.lock().pop_front();
        match scripted {
            Some(error) => Err(error),
            None => Ok(Lsn::new(self.next_lsn.fetch_add(1, Ordering::SeqCst))),
        }
    }

    async fn register(&self) -> CoreResult<Lsn> {
        self.record(Call::Register);
        Ok(Lsn::new(5))
    }

    fn unregister(&self, vsn: Lsn) -> CoreResult<()> {
        self.record(Call::Unregister(vsn));
        Ok(())
    }

    fn error_if_state_provider_is_not_registered(
        &self,
        state_provider_id: StateProviderId,
        _txn: TransactionId,
    ) -> CoreResult<()> {
        if self.unregistered.lock().contains(&state_provider_id) {
            return Err(CoreError::not_registered(state_provider_id.to_string()));
        }
        Ok(())
    }

    fn single_operation_transaction_abort_unlock(
        &self,
        state_provider_id: StateProviderId,
        lock_context: Arc<dyn LockContext>,
    ) {
        self.record(Call::AbortUnlock(state_provider_id));
        lock_context.unlock(TransactionOutcome::Aborted);
    }
}

/// Lock context that records how it was released.
#[derive(Debug, Default)]
pub(crate) struct RecordingLock {
    pub(crate) tracking: bool,
    pub(crate) released: Mutex<Vec<TransactionOutcome>>,
}

impl RecordingLock {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn tracking() -> Arc<Self> {
        Arc::new(Self {
            tracking: true,
            released: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn releases(&self) -> Vec<TransactionOutcome> {
        self.released.lock().clone()
    }
}

impl LockContext for RecordingLock {
    fn is_tracking_context(&self) -> bool {
        self.tracking
    }

    fn unlock(&self, outcome: TransactionOutcome) {
        self.released.lock().push(outcome);
    }
}
