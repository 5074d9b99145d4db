//! Read/write transaction handle.

use super::base::TransactionBase;
use super::lock::{LockContext, TransactionOutcome};
use super::manager::TransactionManager;
use super::state::{AbortReason, TransactionState};
use crate::config::TransactionConfig;
use crate::error::{CoreError, CoreResult};
use crate::types::{Lsn, OperationData, StateProviderId, TransactionId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// What has reached the log so far.
#[derive(Debug)]
enum WriteSet {
    /// Nothing added: the transaction is read-only.
    Empty,
    /// One operation buffered; begin has not been logged.
    Pending(StateProviderId, OperationData),
    /// Begin and at least one operation are in the log.
    Begun,
}

struct TransactionInner {
    base: TransactionBase,
    writes: Mutex<WriteSet>,
    visibility_lsn: Mutex<Option<Lsn>>,
    disposed: AtomicBool,
}

/// A read/write transaction.
///
/// Handles are cheap to clone; all clones refer to the same transaction.
/// A transaction that only ever adds one operation is committed in a
/// single round trip: the first operation is buffered and only logged
/// together with begin once a second operation arrives or commit runs.
#[derive(Clone)]
pub struct Transaction {
    inner: Arc<TransactionInner>,
}

/// Non-owning reference to a [`Transaction`].
#[derive(Clone)]
pub struct WeakTransaction {
    inner: Weak<TransactionInner>,
}

impl WeakTransaction {
    /// Returns the transaction if any handle is still alive.
    pub fn upgrade(&self) -> Option<Transaction> {
        self.inner.upgrade().map(|inner| Transaction { inner })
    }
}

enum CommitPath {
    ReadOnly,
    SingleOperation(StateProviderId, OperationData),
    Begun,
}

impl Transaction {
    /// Creates a transaction that calls back into `manager`.
    pub fn new(
        id: TransactionId,
        manager: Weak<dyn TransactionManager>,
        config: TransactionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(TransactionInner {
                base: TransactionBase::new(id, manager, config),
                writes: Mutex::new(WriteSet::Empty),
                visibility_lsn: Mutex::new(None),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Returns the transaction ID.
    pub fn id(&self) -> TransactionId {
        self.inner.base.id()
    }

    /// Returns the current state.
    pub fn state(&self) -> TransactionState {
        self.inner.base.state()
    }

    /// Returns why the transaction is aborting, if it is.
    pub fn abort_reason(&self) -> AbortReason {
        self.inner.base.abort_reason()
    }

    /// Commit LSN, `Lsn::INVALID` until committed.
    pub fn commit_sequence_number(&self) -> Lsn {
        self.inner.base.commit_sequence_number()
    }

    /// Returns true once an operation has been added.
    pub fn is_write_transaction(&self) -> bool {
        !matches!(*self.inner.writes.lock(), WriteSet::Empty)
    }

    /// Number of lock contexts still held.
    pub fn lock_context_count(&self) -> usize {
        self.inner.base.lock_context_count()
    }

    /// Returns a non-owning reference.
    pub fn downgrade(&self) -> WeakTransaction {
        WeakTransaction {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Adds an operation on behalf of a state provider.
    ///
    /// `lock_context` is held until the transaction commits or the handle
    /// is disposed.
    pub fn add_operation(
        &self,
        state_provider_id: StateProviderId,
        operation: OperationData,
        lock_context: Option<Arc<dyn LockContext>>,
    ) -> CoreResult<()> {
        let base = &self.inner.base;
        let manager = base.manager()?;
        manager.error_if_state_provider_is_not_registered(state_provider_id, base.id())?;

        base.state.on_add_operation(|| {
            let mut writes = self.inner.writes.lock();
            match std::mem::replace(&mut *writes, WriteSet::Begun) {
                WriteSet::Empty => {
                    *writes = WriteSet::Pending(state_provider_id, operation);
                    Ok(())
                }
                WriteSet::Pending(first_id, first) => {
                    if let Err(e) = manager.begin_transaction(base.id(), first_id, &first) {
                        *writes = WriteSet::Pending(first_id, first);
                        return Err(e);
                    }
                    manager.add_operation(base.id(), state_provider_id, &operation)
                }
                WriteSet::Begun => manager.add_operation(base.id(), state_provider_id, &operation),
            }
        })?;

        if let Some(context) = lock_context {
            base.add_lock_context(context);
        }
        Ok(())
    }

    /// Records a lock context acquired outside of [`add_operation`](Self::add_operation).
    pub fn add_lock_context(&self, lock_context: Arc<dyn LockContext>) -> CoreResult<()> {
        self.inner.base.state.on_add_operation(|| {
            self.inner.base.add_lock_context(lock_context);
            Ok(())
        })
    }

    /// Returns the visibility sequence number of this transaction's reads.
    ///
    /// The first call registers with the manager; later calls return the
    /// cached value. The number is unregistered on [`dispose`](Self::dispose).
    pub async fn get_visibility_sequence_number(&self) -> CoreResult<Lsn> {
        if let Some(vsn) = *self.inner.visibility_lsn.lock() {
            return Ok(vsn);
        }

        let base = &self.inner.base;
        base.state.on_begin_read()?;
        let result = match base.manager() {
            Ok(manager) => manager.register().await,
            Err(e) => Err(e),
        };
        if let Ok(vsn) = result {
            *self.inner.visibility_lsn.lock() = Some(vsn);
        }
        base.state.on_end_read();
        result
    }

    /// Commits with the configured default timeout.
    pub async fn commit(&self) -> CoreResult<Lsn> {
        let timeout = self.inner.base.config.default_commit_timeout;
        self.commit_with(timeout, &CancellationToken::new()).await
    }

    /// Commits, retrying retriable failures until `timeout` or `cancel`.
    ///
    /// On timeout or cancellation the transaction returns to `Active` and
    /// may be committed again. Any other failure faults it.
    ///
    /// If the handle was disposed while the commit was in flight, a failed
    /// commit finishes that dispose before returning.
    pub async fn commit_with(&self, timeout: Duration, cancel: &CancellationToken) -> CoreResult<Lsn> {
        let result = self.run_commit(timeout, cancel).await;
        if result.is_err() && self.inner.disposed.load(Ordering::SeqCst) {
            self.release_resources().await;
        }
        result
    }

    async fn run_commit(&self, timeout: Duration, cancel: &CancellationToken) -> CoreResult<Lsn> {
        let base = &self.inner.base;
        base.state.on_begin_commit()?;

        let manager = match base.manager() {
            Ok(manager) => manager,
            Err(e) => {
                base.state.on_commit_faulted();
                return Err(e);
            }
        };

        let path = match &*self.inner.writes.lock() {
            WriteSet::Empty => CommitPath::ReadOnly,
            WriteSet::Pending(id, op) => CommitPath::SingleOperation(*id, op.clone()),
            WriteSet::Begun => CommitPath::Begun,
        };

        if let CommitPath::ReadOnly = path {
            base.release_lock_contexts(TransactionOutcome::Committed(Lsn::INVALID));
            base.state.on_commit_successful();
            debug!(txn = %base.id(), "committed read-only transaction");
            return Ok(Lsn::INVALID);
        }

        let started = Instant::now();
        let mut delay = base.config.initial_retry_delay;
        loop {
            let result = match &path {
                CommitPath::SingleOperation(id, op) => {
                    manager.begin_transaction_async(base.id(), *id, op).await
                }
                _ => manager.commit_transaction(base.id()).await,
            };

            match result {
                Ok(lsn) => {
                    base.set_commit_sequence_number(lsn);
                    *self.inner.writes.lock() = WriteSet::Begun;
                    // contexts move to the commit before the state leaves Committing
                    base.release_lock_contexts(TransactionOutcome::Committed(lsn));
                    base.state.on_commit_successful();
                    debug!(txn = %base.id(), %lsn, "committed");
                    return Ok(lsn);
                }
                Err(e) if e.is_retriable() => {
                    if cancel.is_cancelled() {
                        base.state.on_commit_cancelled();
                        return Err(CoreError::Cancelled);
                    }
                    if started.elapsed() >= timeout {
                        base.state.on_commit_cancelled();
                        return Err(CoreError::Timeout);
                    }
                    debug!(txn = %base.id(), error = %e, ?delay, "commit retry");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            base.state.on_commit_cancelled();
                            return Err(CoreError::Cancelled);
                        }
                    }
                    delay = base.config.next_retry_delay(delay);
                }
                Err(e) => {
                    warn!(txn = %base.id(), error = %e, "commit faulted");
                    base.state.on_commit_faulted();
                    return Err(e);
                }
            }
        }
    }

    /// Starts aborting without waiting for the abort to finish.
    ///
    /// Requires a tokio runtime.
    pub fn abort(&self) -> CoreResult<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| CoreError::invalid_operation("abort requires a tokio runtime"))?;
        self.inner.base.state.on_begin_abort(AbortReason::UserAborted)?;

        let this = self.clone();
        runtime.spawn(async move {
            if let Err(e) = this.run_abort().await {
                warn!(txn = %this.id(), error = %e, "background abort failed");
            }
        });
        Ok(())
    }

    /// Aborts and waits for the abort record to be logged.
    pub async fn abort_async(&self) -> CoreResult<()> {
        self.inner.base.state.on_begin_abort(AbortReason::UserAborted)?;
        self.run_abort().await
    }

    /// Aborts on behalf of the replicator.
    ///
    /// Later calls on the handle fail with
    /// [`CoreError::TransactionAbortedBySystem`].
    pub async fn abort_by_system(&self) -> CoreResult<()> {
        self.inner.base.state.on_begin_abort(AbortReason::SystemAborted)?;
        self.run_abort().await
    }

    /// Releases the handle.
    ///
    /// An active write transaction is aborted with reason `UserDisposed`.
    /// The visibility sequence number is unregistered and any lock context
    /// not transferred at commit is released. While a commit is in flight
    /// the lock contexts stay with it.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.release_resources().await;
    }

    async fn release_resources(&self) {
        let base = &self.inner.base;
        let manager = base.manager().ok();
        let unregister = |vsn: Lsn| {
            if let Some(manager) = manager.as_ref() {
                if let Err(e) = manager.unregister(vsn) {
                    debug!(txn = %base.id(), %vsn, error = %e, "unregister on dispose failed");
                }
            }
        };

        if self.is_write_transaction() {
            let started = base.state.on_user_dispose_begin_abort(|| {
                if let Some(vsn) = self.inner.visibility_lsn.lock().take() {
                    unregister(vsn);
                }
            });
            if started.is_ok() {
                if let Err(e) = self.run_abort().await {
                    warn!(txn = %base.id(), error = %e, "abort on dispose failed");
                }
            }
        }

        let vsn = self.inner.visibility_lsn.lock().take();
        if let Some(vsn) = vsn {
            unregister(vsn);
        }
        if base.state() == TransactionState::Committing {
            debug!(txn = %base.id(), "disposed during commit; lock contexts stay with the commit");
            return;
        }
        base.release_lock_contexts(TransactionOutcome::Aborted);
    }

    async fn run_abort(&self) -> CoreResult<()> {
        let base = &self.inner.base;
        let begun = {
            let mut writes = self.inner.writes.lock();
            match *writes {
                WriteSet::Begun => true,
                _ => {
                    *writes = WriteSet::Empty;
                    false
                }
            }
        };
        if !begun {
            // nothing reached the log
            base.state.on_abort_successful();
            return Ok(());
        }

        let manager = match base.manager() {
            Ok(manager) => manager,
            Err(e) => {
                base.state.on_abort_faulted();
                return Err(e);
            }
        };

        let mut delay = base.config.initial_retry_delay;
        loop {
            match manager.abort_transaction(base.id()).await {
                Ok(lsn) => {
                    base.state.on_abort_successful();
                    debug!(txn = %base.id(), %lsn, reason = ?base.abort_reason(), "aborted");
                    return Ok(());
                }
                Err(e) if e.is_retriable() => {
                    debug!(txn = %base.id(), error = %e, ?delay, "abort retry");
                    tokio::time::sleep(delay).await;
                    delay = base.config.next_retry_delay(delay);
                }
                Err(e) => {
                    warn!(txn = %base.id(), error = %e, "abort faulted");
                    base.state.on_abort_faulted();
                    return Err(e);
                }
            }
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
