//! Transactional replicator.

use crate::activity::{ActivityPhase, ServiceActivity};
use crate::config::ReplicatorConfig;
use crate::log::{BackupInfo, BecomeSecondaryDelegate, LogReplicator};
use crate::partition::{FaultType, StatefulPartition};
use crate::state_manager::{RegisteredStateProvider, StateManager, StateProvider};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};
use txnrep_core::{
    AtomicOperation, AtomicRedoOperation, CommitKind, CoreError, CoreResult, Epoch, LockContext,
    Lsn, OperationData, ReplicaRole, StateProviderId, Transaction, TransactionChangeEvent,
    TransactionChangeFeed, TransactionId, TransactionIdGenerator, TransactionManager,
    TransactionState, TryRemoveVersionResult, VersionManager, WeakTransaction,
};

/// Snapshot of the replicator's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicatorInfo {
    /// Current role.
    pub role: ReplicaRole,
    /// LSN persisted by a write quorum.
    pub last_stable_lsn: Lsn,
    /// LSN of the last commit or barrier.
    pub last_committed_lsn: Lsn,
    /// Current epoch.
    pub current_epoch: Epoch,
}

/// Changes the state manager's role when the log asks for it.
struct StateManagerBecomeSecondary<'a, S> {
    state_manager: &'a S,
}

#[async_trait]
impl<'a, S: StateManager> BecomeSecondaryDelegate for StateManagerBecomeSecondary<'a, S> {
    async fn become_active_secondary(&self) -> CoreResult<()> {
        self.state_manager
            .change_role(ReplicaRole::ActiveSecondary)
            .await
    }
}

/// Sequences open, close and role changes across the replicated log and the
/// state manager, and serves transactions as their [`TransactionManager`].
///
/// Every public call passes through an activity gate: once close starts,
/// calls fail with [`CoreError::ObjectClosed`] and close waits for the calls
/// already in flight.
pub struct TransactionalReplicator<L, S> {
    config: ReplicatorConfig,
    log: Arc<L>,
    state_manager: Arc<S>,
    partition: Arc<dyn StatefulPartition>,
    activity: ServiceActivity,
    versions: VersionManager,
    feed: TransactionChangeFeed,
    role: RwLock<ReplicaRole>,
    recovered: AtomicBool,
    role_change_faulted: AtomicBool,
    /// Transactions created here that may still need a system abort.
    transactions: Mutex<HashMap<TransactionId, WeakTransaction>>,
    /// Operations logged per begun transaction.
    operation_counts: Mutex<HashMap<TransactionId, usize>>,
    /// Held from appending a commit record until its event is published.
    commit_order: tokio::sync::Mutex<()>,
}

impl<L, S> TransactionalReplicator<L, S>
where
    L: LogReplicator + 'static,
    S: StateManager + 'static,
{
    /// Creates a replicator. Call [`open`](Self::open) before use.
    pub fn new(
        config: ReplicatorConfig,
        log: Arc<L>,
        state_manager: Arc<S>,
        partition: Arc<dyn StatefulPartition>,
    ) -> Arc<Self> {
        let feed = TransactionChangeFeed::with_max_history(config.change_feed_history);
        Arc::new(Self {
            config,
            log,
            state_manager,
            partition,
            activity: ServiceActivity::new(),
            versions: VersionManager::new(),
            feed,
            role: RwLock::new(ReplicaRole::Unknown),
            recovered: AtomicBool::new(false),
            role_change_faulted: AtomicBool::new(false),
            transactions: Mutex::new(HashMap::new()),
            operation_counts: Mutex::new(HashMap::new()),
            commit_order: tokio::sync::Mutex::new(()),
        })
    }

    /// The replicated log.
    pub fn log(&self) -> &Arc<L> {
        &self.log
    }

    /// The state manager.
    pub fn state_manager(&self) -> &Arc<S> {
        &self.state_manager
    }

    /// Phase of the activity gate.
    pub fn activity_phase(&self) -> ActivityPhase {
        self.activity.phase()
    }

    /// Number of begun transactions whose operations are still counted.
    pub fn tracked_transaction_count(&self) -> usize {
        self.operation_counts.lock().len()
    }

    /// Returns true after a role change failed.
    pub fn is_faulted(&self) -> bool {
        self.role_change_faulted.load(Ordering::SeqCst)
    }

    /// Opens the log, then the state manager, then recovers the log.
    ///
    /// A failure at any stage closes the replicator before the error is
    /// returned.
    pub async fn open(&self) -> CoreResult<()> {
        self.activity.open()?;
        info!("opening replicator");

        if let Err(e) = self.open_stages().await {
            warn!(error = %e, "open failed; closing");
            if let Err(close_error) = self.close().await {
                warn!(error = %close_error, "close after failed open also failed");
            }
            return Err(e);
        }
        info!("replicator opened");
        Ok(())
    }

    async fn open_stages(&self) -> CoreResult<()> {
        let recovery = self.log.open().await?;
        debug!(?recovery, "log opened");

        self.state_manager
            .open(
                recovery.should_complete_checkpoint,
                recovery.should_remove_local_state,
            )
            .await?;

        if recovery.should_skip_recovery {
            info!("replica is being dropped; skipping log recovery");
            return Ok(());
        }
        self.log.perform_recovery(&recovery).await?;
        self.recovered.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Closes the replicator.
    ///
    /// New calls are refused at once; calls in flight get
    /// `close_drain_timeout` to finish. The log is closed only if it was
    /// recovered and is always disposed. Closing twice is a no-op.
    pub async fn close(&self) -> CoreResult<()> {
        if !self.activity.begin_close() {
            debug!("close already started");
            return Ok(());
        }
        info!("closing replicator");

        if !self.activity.drain(self.config.close_drain_timeout).await {
            warn!(
                active = self.activity.active_count(),
                "closing with calls still in flight"
            );
        }

        let mut result = Ok(());
        if self.recovered.load(Ordering::SeqCst) {
            if let Err(e) = self.log.close().await {
                warn!(error = %e, "log close failed");
                result = Err(e);
            }
        } else {
            debug!("log not recovered; disposing without close");
        }
        self.log.dispose();

        if let Err(e) = self.state_manager.close().await {
            warn!(error = %e, "state manager close failed");
            if result.is_ok() {
                result = Err(e);
            }
        }

        self.activity.mark_closed();
        info!("replicator closed");
        result
    }

    /// Starts closing without waiting.
    pub fn abort(self: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("abort outside a tokio runtime ignored");
            return;
        };
        let this = Arc::clone(self);
        runtime.spawn(async move {
            if let Err(e) = this.close().await {
                warn!(error = %e, "close on abort failed");
            }
        });
    }

    /// Changes the replica role.
    ///
    /// After a failure the replicator reports a transient fault to the
    /// partition and refuses every later role change with
    /// [`CoreError::Unexpected`].
    pub async fn change_role(&self, new_role: ReplicaRole) -> CoreResult<()> {
        let _token = self.activity.try_acquire()?;
        if self.role_change_faulted.load(Ordering::SeqCst) {
            return Err(CoreError::unexpected(
                "an earlier role change failed; the replica must be restarted",
            ));
        }

        let previous = *self.role.read();
        info!(?previous, ?new_role, "changing role");

        if previous == ReplicaRole::Primary && new_role != ReplicaRole::Primary {
            self.abort_active_transactions().await;
        }

        match self.change_role_stages(new_role).await {
            Ok(()) => {
                *self.role.write() = new_role;
                if previous == ReplicaRole::Primary && new_role != ReplicaRole::Primary {
                    // the log dropped every begun transaction
                    self.operation_counts.lock().clear();
                }
                info!(role = ?new_role, "role changed");
                Ok(())
            }
            Err(e) => {
                error!(?previous, ?new_role, error = %e, "role change failed");
                self.role_change_faulted.store(true, Ordering::SeqCst);
                self.partition.report_fault(FaultType::Transient);
                Err(e)
            }
        }
    }

    async fn change_role_stages(&self, new_role: ReplicaRole) -> CoreResult<()> {
        match new_role {
            ReplicaRole::Primary => {
                self.log.become_primary().await?;
                self.state_manager.change_role(new_role).await
            }
            ReplicaRole::IdleSecondary => {
                self.log.become_idle_secondary().await?;
                self.state_manager.change_role(new_role).await
            }
            ReplicaRole::ActiveSecondary => {
                let delegate = StateManagerBecomeSecondary {
                    state_manager: self.state_manager.as_ref(),
                };
                self.log.become_active_secondary(&delegate).await
            }
            ReplicaRole::None => {
                self.log.become_none().await?;
                self.state_manager.change_role(new_role).await?;
                self.log.delete_log().await
            }
            ReplicaRole::Unknown => Err(CoreError::InvalidRole {
                role: new_role.to_string(),
            }),
        }
    }

    async fn abort_active_transactions(&self) {
        let live: Vec<Transaction> = self
            .transactions
            .lock()
            .drain()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect();

        for txn in live {
            if txn.state() != TransactionState::Active {
                continue;
            }
            match txn.abort_by_system().await {
                Ok(()) => debug!(txn = %txn.id(), "aborted on losing primary"),
                Err(e) => debug!(txn = %txn.id(), error = %e, "system abort failed"),
            }
        }
    }

    /// Creates a read/write transaction.
    pub fn create_transaction(self: &Arc<Self>) -> CoreResult<Transaction> {
        let _token = self.activity.try_acquire()?;
        let id = TransactionIdGenerator::global().next_transaction_id();
        let txn = Transaction::new(id, self.as_manager(), self.config.transaction.clone());

        let mut transactions = self.transactions.lock();
        transactions.retain(|_, weak| {
            weak.upgrade()
                .is_some_and(|txn| !txn.state().is_terminal())
        });
        transactions.insert(id, txn.downgrade());
        self.operation_counts
            .lock()
            .retain(|id, _| transactions.contains_key(id));
        Ok(txn)
    }

    /// Creates an atomic operation.
    pub fn create_atomic_operation(self: &Arc<Self>) -> CoreResult<AtomicOperation> {
        let _token = self.activity.try_acquire()?;
        let id = TransactionIdGenerator::global().next_atomic_operation_id();
        Ok(AtomicOperation::new(
            id,
            self.as_manager(),
            self.config.transaction.clone(),
        ))
    }

    /// Creates a redo-only atomic operation.
    pub fn create_atomic_redo_operation(self: &Arc<Self>) -> CoreResult<AtomicRedoOperation> {
        let _token = self.activity.try_acquire()?;
        let id = TransactionIdGenerator::global().next_atomic_operation_id();
        Ok(AtomicRedoOperation::new(
            id,
            self.as_manager(),
            self.config.transaction.clone(),
        ))
    }

    fn as_manager(self: &Arc<Self>) -> Weak<dyn TransactionManager> {
        let weak: Weak<Self> = Arc::downgrade(self);
        weak
    }

    /// Looks up a committed state provider.
    pub fn get(&self, name: &str) -> CoreResult<RegisteredStateProvider> {
        let _token = self.activity.try_acquire()?;
        self.state_manager.get(name)
    }

    /// Registers a state provider as part of `txn`.
    pub async fn add(
        &self,
        txn: &Transaction,
        provider: Arc<dyn StateProvider>,
    ) -> CoreResult<StateProviderId> {
        let _token = self.activity.try_acquire()?;
        self.state_manager.add(txn, provider).await
    }

    /// Unregisters a state provider as part of `txn`.
    pub async fn remove(&self, txn: &Transaction, name: &str) -> CoreResult<()> {
        let _token = self.activity.try_acquire()?;
        self.state_manager.remove(txn, name).await
    }

    /// Returns the existing provider or registers `provider` as part of `txn`.
    pub async fn get_or_add(
        &self,
        txn: &Transaction,
        provider: Arc<dyn StateProvider>,
    ) -> CoreResult<(RegisteredStateProvider, bool)> {
        let _token = self.activity.try_acquire()?;
        self.state_manager.get_or_add(txn, provider).await
    }

    /// Committed state providers ordered by name.
    pub fn create_enumerator(&self) -> CoreResult<Vec<RegisteredStateProvider>> {
        let _token = self.activity.try_acquire()?;
        self.state_manager.create_enumerator()
    }

    /// Takes a backup.
    pub async fn backup(&self, label: &str) -> CoreResult<BackupInfo> {
        let _token = self.activity.try_acquire()?;
        let backup = self.log.backup(label).await?;
        info!(lsn = %backup.lsn, label, "backup taken");
        Ok(backup)
    }

    /// Restores from a backup.
    pub async fn restore(&self, backup: &BackupInfo) -> CoreResult<()> {
        let _token = self.activity.try_acquire()?;
        self.log.restore(backup).await?;
        info!(lsn = %backup.lsn, label = %backup.label, "restored");
        Ok(())
    }

    /// Checks whether a version can be removed without blocking.
    pub fn try_remove_version(
        &self,
        state_provider_id: StateProviderId,
        commit_lsn: Lsn,
        next_commit_lsn: Lsn,
    ) -> CoreResult<TryRemoveVersionResult> {
        let _token = self.activity.try_acquire()?;
        Ok(self
            .versions
            .try_remove_version(state_provider_id, commit_lsn, next_commit_lsn))
    }

    /// Waits until a checkpoint is no longer visible to any reader.
    pub async fn try_remove_checkpoint(
        &self,
        checkpoint_lsn_to_be_removed: Lsn,
        next_checkpoint_lsn: Lsn,
    ) -> CoreResult<()> {
        let _token = self.activity.try_acquire()?;
        self.versions
            .try_remove_checkpoint(checkpoint_lsn_to_be_removed, next_checkpoint_lsn)
            .await
    }

    /// Returns role, progress and epoch.
    pub fn get_info(&self) -> CoreResult<ReplicatorInfo> {
        let _token = self.activity.try_acquire()?;
        Ok(ReplicatorInfo {
            role: *self.role.read(),
            last_stable_lsn: self.log.last_stable_lsn(),
            last_committed_lsn: self.log.last_committed_lsn(),
            current_epoch: self.log.current_epoch(),
        })
    }

    /// Starts a new epoch.
    pub async fn update_epoch(&self, epoch: Epoch, previous_epoch_last_lsn: Lsn) -> CoreResult<()> {
        let _token = self.activity.try_acquire()?;
        info!(%epoch, %previous_epoch_last_lsn, "updating epoch");
        self.log.update_epoch(epoch, previous_epoch_last_lsn).await
    }

    /// Subscribes to commit events.
    pub fn subscribe(&self) -> Receiver<TransactionChangeEvent> {
        self.feed.subscribe()
    }

    /// Commit events after `cursor`.
    pub fn poll_changes(&self, cursor: Lsn, limit: usize) -> Vec<TransactionChangeEvent> {
        self.feed.poll(cursor, limit)
    }

    /// Publishes a commit. Callers hold `commit_order`.
    fn committed(&self, txn: TransactionId, lsn: Lsn, kind: CommitKind, operation_count: usize) {
        self.transactions.lock().remove(&txn);
        self.feed.emit(TransactionChangeEvent {
            transaction_id: txn,
            commit_lsn: lsn,
            kind,
            operation_count,
        });
    }

    fn forget(&self, txn: TransactionId) {
        self.operation_counts.lock().remove(&txn);
        self.transactions.lock().remove(&txn);
    }

    async fn commit_logged(&self, txn: TransactionId) -> CoreResult<Lsn> {
        let _token = self.activity.try_acquire()?;
        let _order = self.commit_order.lock().await;
        let lsn = self.log.commit_transaction(txn).await?;
        let count = self.operation_counts.lock().remove(&txn).unwrap_or(0);
        self.committed(txn, lsn, CommitKind::Transaction, count);
        Ok(lsn)
    }

    async fn abort_logged(&self, txn: TransactionId) -> CoreResult<Lsn> {
        let _token = self.activity.try_acquire()?;
        self.log.abort_transaction(txn).await
    }
}

/// True once `result` ends the transaction: success or a failure the
/// handle will not retry.
fn is_final<T>(result: &CoreResult<T>) -> bool {
    result.as_ref().map_or_else(|e| !e.is_retriable(), |_| true)
}

#[async_trait]
impl<L, S> TransactionManager for TransactionalReplicator<L, S>
where
    L: LogReplicator + 'static,
    S: StateManager + 'static,
{
    fn role(&self) -> ReplicaRole {
        *self.role.read()
    }

    fn begin_transaction(
        &self,
        txn: TransactionId,
        state_provider_id: StateProviderId,
        operation: &OperationData,
    ) -> CoreResult<()> {
        let _token = self.activity.try_acquire()?;
        self.log.begin_transaction(txn, state_provider_id, operation)?;
        self.operation_counts.lock().insert(txn, 1);
        Ok(())
    }

    async fn begin_transaction_async(
        &self,
        txn: TransactionId,
        state_provider_id: StateProviderId,
        operation: &OperationData,
    ) -> CoreResult<Lsn> {
        let _token = self.activity.try_acquire()?;
        let _order = self.commit_order.lock().await;
        let lsn = self
            .log
            .begin_and_commit(txn, state_provider_id, operation)
            .await?;
        self.committed(txn, lsn, CommitKind::Transaction, 1);
        Ok(lsn)
    }

    fn add_operation(
        &self,
        txn: TransactionId,
        state_provider_id: StateProviderId,
        operation: &OperationData,
    ) -> CoreResult<()> {
        let _token = self.activity.try_acquire()?;
        self.log.add_operation(txn, state_provider_id, operation)?;
        *self.operation_counts.lock().entry(txn).or_insert(0) += 1;
        Ok(())
    }

    async fn add_atomic_operation(
        &self,
        txn: TransactionId,
        state_provider_id: StateProviderId,
        operation: &OperationData,
    ) -> CoreResult<Lsn> {
        let _token = self.activity.try_acquire()?;
        let _order = self.commit_order.lock().await;
        let lsn = self
            .log
            .atomic_operation(txn, state_provider_id, operation, false)
            .await?;
        self.committed(txn, lsn, CommitKind::AtomicOperation, 1);
        Ok(lsn)
    }

    async fn add_atomic_redo_operation(
        &self,
        txn: TransactionId,
        state_provider_id: StateProviderId,
        operation: &OperationData,
    ) -> CoreResult<Lsn> {
        let _token = self.activity.try_acquire()?;
        let _order = self.commit_order.lock().await;
        let lsn = self
            .log
            .atomic_operation(txn, state_provider_id, operation, true)
            .await?;
        self.committed(txn, lsn, CommitKind::AtomicRedoOperation, 1);
        Ok(lsn)
    }

    async fn commit_transaction(&self, txn: TransactionId) -> CoreResult<Lsn> {
        let result = self.commit_logged(txn).await;
        if result.is_err() && is_final(&result) {
            self.forget(txn);
        }
        result
    }

    async fn abort_transaction(&self, txn: TransactionId) -> CoreResult<Lsn> {
        let result = self.abort_logged(txn).await;
        if is_final(&result) {
            self.forget(txn);
        }
        result
    }

    async fn register(&self) -> CoreResult<Lsn> {
        let _token = self.activity.try_acquire()?;
        Ok(self.versions.register(self.log.last_committed_lsn()))
    }

    fn unregister(&self, vsn: Lsn) -> CoreResult<()> {
        // not gated: a pending checkpoint removal may be waiting on this reader
        self.versions.unregister(vsn);
        Ok(())
    }

    fn error_if_state_provider_is_not_registered(
        &self,
        state_provider_id: StateProviderId,
        txn: TransactionId,
    ) -> CoreResult<()> {
        let _token = self.activity.try_acquire()?;
        if self.state_manager.is_registered(state_provider_id) {
            return Ok(());
        }
        debug!(%txn, sp = %state_provider_id, "operation on unregistered state provider");
        Err(CoreError::not_registered(state_provider_id.to_string()))
    }

    fn single_operation_transaction_abort_unlock(
        &self,
        state_provider_id: StateProviderId,
        lock_context: Arc<dyn LockContext>,
    ) {
        self.state_manager
            .single_operation_transaction_abort_unlock(state_provider_id, lock_context);
    }
}
