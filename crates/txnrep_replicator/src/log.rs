//! Replicated-log collaborator.
//!
//! The replicator drives the log through [`LogReplicator`]; the physical
//! log writer and the replication channel live behind it.
//! [`MemoryLogReplicator`] keeps records in memory and supports failure
//! injection for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace};
use txnrep_core::{
    CoreError, CoreResult, Epoch, Lsn, OperationData, ReplicaRole, StateProviderId, TransactionId,
};

/// What the log found on open and what the replicator must do about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryInformation {
    /// The state manager must complete an interrupted checkpoint.
    pub should_complete_checkpoint: bool,
    /// Local state is stale and must be removed.
    pub should_remove_local_state: bool,
    /// The replica is being dropped; skip log recovery.
    pub should_skip_recovery: bool,
    /// Last LSN found in the log.
    pub recovered_lsn: Lsn,
}

impl Default for RecoveryInformation {
    fn default() -> Self {
        Self {
            should_complete_checkpoint: false,
            should_remove_local_state: false,
            should_skip_recovery: false,
            recovered_lsn: Lsn::ZERO,
        }
    }
}

/// Description of a backup taken from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfo {
    /// Last committed LSN included in the backup.
    pub lsn: Lsn,
    /// Epoch at the time of the backup.
    pub epoch: Epoch,
    /// Caller-supplied label.
    pub label: String,
}

/// Callback the log invokes while becoming active secondary.
///
/// The log decides when, relative to its own barrier processing, the
/// state manager changes role.
#[async_trait]
pub trait BecomeSecondaryDelegate: Send + Sync {
    /// Changes the state manager's role to active secondary.
    async fn become_active_secondary(&self) -> CoreResult<()>;
}

/// Interface to the replicated log.
#[async_trait]
pub trait LogReplicator: Send + Sync {
    /// Opens the log and reports what recovery requires.
    async fn open(&self) -> CoreResult<RecoveryInformation>;

    /// Replays the log.
    async fn perform_recovery(&self, info: &RecoveryInformation) -> CoreResult<()>;

    /// Becomes primary. Writes are accepted afterwards.
    async fn become_primary(&self) -> CoreResult<()>;

    /// Becomes idle secondary.
    async fn become_idle_secondary(&self) -> CoreResult<()>;

    /// Becomes active secondary, calling `delegate` at the point where the
    /// state manager must change role.
    async fn become_active_secondary(&self, delegate: &dyn BecomeSecondaryDelegate) -> CoreResult<()>;

    /// Becomes none and flushes the log.
    async fn become_none(&self) -> CoreResult<()>;

    /// Closes a recovered log.
    async fn close(&self) -> CoreResult<()>;

    /// Deletes the log of a replica that became none.
    async fn delete_log(&self) -> CoreResult<()>;

    /// Releases resources. Always called on replicator close.
    fn dispose(&self);

    /// Starts a new epoch.
    async fn update_epoch(&self, epoch: Epoch, previous_epoch_last_lsn: Lsn) -> CoreResult<()>;

    /// Takes a backup.
    async fn backup(&self, label: &str) -> CoreResult<BackupInfo>;

    /// Restores from a backup.
    async fn restore(&self, backup: &BackupInfo) -> CoreResult<()>;

    /// Appends begin plus the first operation of a transaction.
    fn begin_transaction(
        &self,
        txn: TransactionId,
        state_provider_id: StateProviderId,
        operation: &OperationData,
    ) -> CoreResult<()>;

    /// Appends an operation to a begun transaction.
    fn add_operation(
        &self,
        txn: TransactionId,
        state_provider_id: StateProviderId,
        operation: &OperationData,
    ) -> CoreResult<()>;

    /// Appends begin, operation and commit of a single-operation transaction.
    async fn begin_and_commit(
        &self,
        txn: TransactionId,
        state_provider_id: StateProviderId,
        operation: &OperationData,
    ) -> CoreResult<Lsn>;

    /// Appends an atomic operation.
    async fn atomic_operation(
        &self,
        txn: TransactionId,
        state_provider_id: StateProviderId,
        operation: &OperationData,
        redo_only: bool,
    ) -> CoreResult<Lsn>;

    /// Appends the commit record of a begun transaction.
    async fn commit_transaction(&self, txn: TransactionId) -> CoreResult<Lsn>;

    /// Appends the abort record of a begun transaction.
    async fn abort_transaction(&self, txn: TransactionId) -> CoreResult<Lsn>;

    /// LSN of the last commit or barrier.
    fn last_committed_lsn(&self) -> Lsn;

    /// LSN up to which a write quorum has persisted the log.
    fn last_stable_lsn(&self) -> Lsn;

    /// Current epoch.
    fn current_epoch(&self) -> Epoch;
}

/// Kind of an in-memory log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRecordKind {
    /// Barrier appended when becoming primary.
    Barrier,
    /// Transaction begin with its first operation.
    BeginTransaction,
    /// Further operation of a transaction.
    Operation,
    /// Transaction commit.
    Commit,
    /// Transaction abort.
    Abort,
    /// Begin, operation and commit in one record.
    SingleOperationTransaction,
    /// Atomic operation.
    AtomicOperation,
    /// Redo-only atomic operation.
    AtomicRedoOperation,
    /// Epoch change.
    UpdateEpoch,
}

/// One in-memory log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Position in the log.
    pub lsn: Lsn,
    /// Record kind.
    pub kind: LogRecordKind,
    /// Owning transaction, if any.
    pub transaction_id: Option<TransactionId>,
    /// Target state provider, if any.
    pub state_provider_id: Option<StateProviderId>,
}

/// Lifecycle steps of the log that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogStep {
    /// [`LogReplicator::open`].
    Open,
    /// [`LogReplicator::perform_recovery`].
    Recovery,
    /// [`LogReplicator::become_primary`].
    BecomePrimary,
    /// [`LogReplicator::become_idle_secondary`].
    BecomeIdleSecondary,
    /// [`LogReplicator::become_active_secondary`].
    BecomeActiveSecondary,
    /// [`LogReplicator::become_none`].
    BecomeNone,
    /// [`LogReplicator::close`].
    Close,
    /// [`LogReplicator::delete_log`].
    DeleteLog,
}

#[derive(Debug, Default)]
struct LogState {
    role: ReplicaRole,
    records: Vec<LogRecord>,
    last_lsn: i64,
    last_committed: i64,
    epoch: Epoch,
    open_transactions: HashMap<TransactionId, usize>,
    opened: bool,
    recovered: bool,
    closed: bool,
    disposed: bool,
    deleted: bool,
}

impl LogState {
    fn append(
        &mut self,
        kind: LogRecordKind,
        txn: Option<TransactionId>,
        state_provider_id: Option<StateProviderId>,
    ) -> Lsn {
        self.last_lsn += 1;
        let lsn = Lsn::new(self.last_lsn);
        self.records.push(LogRecord {
            lsn,
            kind,
            transaction_id: txn,
            state_provider_id,
        });
        trace!(%lsn, ?kind, "appended");
        lsn
    }

    fn commit_point(&mut self, lsn: Lsn) {
        self.last_committed = lsn.as_i64();
    }

    fn ensure_writable(&self) -> CoreResult<()> {
        if self.disposed || self.closed {
            return Err(CoreError::ObjectClosed);
        }
        if self.role != ReplicaRole::Primary {
            return Err(CoreError::NotPrimary);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FaultPlan {
    steps: HashMap<LogStep, CoreError>,
    writes: VecDeque<CoreError>,
    recovery: RecoveryInformation,
}

/// In-memory log with failure injection.
///
/// Every commit is immediately stable. Becoming primary appends a barrier,
/// so the first visibility sequence number of a new primary is positive.
#[derive(Debug, Default)]
pub struct MemoryLogReplicator {
    state: Mutex<LogState>,
    faults: Mutex<FaultPlan>,
    steps: Mutex<Vec<LogStep>>,
}

impl MemoryLogReplicator {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call of `step` fail with `error`.
    pub fn fail_step(&self, step: LogStep, error: CoreError) {
        self.faults.lock().steps.insert(step, error);
    }

    /// Makes the next write calls (commit, begin-and-commit, atomic, abort)
    /// fail with `errors`, in order.
    pub fn fail_writes(&self, errors: impl IntoIterator<Item = CoreError>) {
        self.faults.lock().writes.extend(errors);
    }

    /// Sets what [`LogReplicator::open`] reports.
    pub fn set_recovery_information(&self, info: RecoveryInformation) {
        self.faults.lock().recovery = info;
    }

    /// Lifecycle steps executed so far, failed ones included.
    pub fn steps(&self) -> Vec<LogStep> {
        self.steps.lock().clone()
    }

    /// Copy of every record.
    pub fn records(&self) -> Vec<LogRecord> {
        self.state.lock().records.clone()
    }

    /// Current role of the log.
    pub fn role(&self) -> ReplicaRole {
        self.state.lock().role
    }

    /// Returns true once recovery ran.
    pub fn is_recovered(&self) -> bool {
        self.state.lock().recovered
    }

    /// Returns true once closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Returns true once disposed.
    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// Returns true once the log was deleted.
    pub fn is_deleted(&self) -> bool {
        self.state.lock().deleted
    }

    /// Number of transactions begun but not yet committed or aborted.
    pub fn open_transaction_count(&self) -> usize {
        self.state.lock().open_transactions.len()
    }

    fn step(&self, step: LogStep) -> CoreResult<()> {
        self.steps.lock().push(step);
        match self.faults.lock().steps.remove(&step) {
            Some(error) => {
                debug!(?step, error = %error, "injected log failure");
                Err(error)
            }
            None => Ok(()),
        }
    }

    fn injected_write_failure(&self) -> CoreResult<()> {
        match self.faults.lock().writes.pop_front() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn change_role(&self, step: LogStep, role: ReplicaRole) -> CoreResult<()> {
        self.step(step)?;
        let mut state = self.state.lock();
        if !state.opened || state.closed {
            return Err(CoreError::ObjectClosed);
        }
        state.role = role;
        if role == ReplicaRole::Primary {
            let lsn = state.append(LogRecordKind::Barrier, None, None);
            state.commit_point(lsn);
        } else {
            state.open_transactions.clear();
        }
        Ok(())
    }
}

#[async_trait]
impl LogReplicator for MemoryLogReplicator {
    async fn open(&self) -> CoreResult<RecoveryInformation> {
        self.step(LogStep::Open)?;
        let mut info = self.faults.lock().recovery;
        let mut state = self.state.lock();
        state.opened = true;
        info.recovered_lsn = Lsn::new(state.last_lsn);
        Ok(info)
    }

    async fn perform_recovery(&self, _info: &RecoveryInformation) -> CoreResult<()> {
        self.step(LogStep::Recovery)?;
        self.state.lock().recovered = true;
        Ok(())
    }

    async fn become_primary(&self) -> CoreResult<()> {
        self.change_role(LogStep::BecomePrimary, ReplicaRole::Primary)
    }

    async fn become_idle_secondary(&self) -> CoreResult<()> {
        self.change_role(LogStep::BecomeIdleSecondary, ReplicaRole::IdleSecondary)
    }

    async fn become_active_secondary(&self, delegate: &dyn BecomeSecondaryDelegate) -> CoreResult<()> {
        self.change_role(LogStep::BecomeActiveSecondary, ReplicaRole::ActiveSecondary)?;
        delegate.become_active_secondary().await
    }

    async fn become_none(&self) -> CoreResult<()> {
        self.change_role(LogStep::BecomeNone, ReplicaRole::None)
    }

    async fn close(&self) -> CoreResult<()> {
        self.step(LogStep::Close)?;
        self.state.lock().closed = true;
        Ok(())
    }

    async fn delete_log(&self) -> CoreResult<()> {
        self.step(LogStep::DeleteLog)?;
        let mut state = self.state.lock();
        state.records.clear();
        state.deleted = true;
        Ok(())
    }

    fn dispose(&self) {
        self.state.lock().disposed = true;
    }

    async fn update_epoch(&self, epoch: Epoch, previous_epoch_last_lsn: Lsn) -> CoreResult<()> {
        let mut state = self.state.lock();
        if epoch < state.epoch {
            return Err(CoreError::invalid_operation(format!(
                "epoch {epoch} is older than current epoch {}",
                state.epoch
            )));
        }
        if previous_epoch_last_lsn.as_i64() > state.last_lsn {
            return Err(CoreError::invalid_operation(format!(
                "{previous_epoch_last_lsn} is beyond the end of the log"
            )));
        }
        state.epoch = epoch;
        state.append(LogRecordKind::UpdateEpoch, None, None);
        Ok(())
    }

    async fn backup(&self, label: &str) -> CoreResult<BackupInfo> {
        let state = self.state.lock();
        if !state.opened || state.closed {
            return Err(CoreError::ObjectClosed);
        }
        Ok(BackupInfo {
            lsn: Lsn::new(state.last_committed),
            epoch: state.epoch,
            label: label.to_string(),
        })
    }

    async fn restore(&self, backup: &BackupInfo) -> CoreResult<()> {
        let mut state = self.state.lock();
        if state.role == ReplicaRole::Primary && !state.open_transactions.is_empty() {
            return Err(CoreError::invalid_operation(
                "restore with transactions in flight",
            ));
        }
        state.records.clear();
        state.last_lsn = backup.lsn.as_i64();
        state.last_committed = backup.lsn.as_i64();
        state.epoch = backup.epoch;
        Ok(())
    }

    fn begin_transaction(
        &self,
        txn: TransactionId,
        state_provider_id: StateProviderId,
        _operation: &OperationData,
    ) -> CoreResult<()> {
        let mut state = self.state.lock();
        state.ensure_writable()?;
        if state.open_transactions.contains_key(&txn) {
            return Err(CoreError::invalid_operation(format!("{txn} already begun")));
        }
        state.append(LogRecordKind::BeginTransaction, Some(txn), Some(state_provider_id));
        state.open_transactions.insert(txn, 1);
        Ok(())
    }

    fn add_operation(
        &self,
        txn: TransactionId,
        state_provider_id: StateProviderId,
        _operation: &OperationData,
    ) -> CoreResult<()> {
        let mut state = self.state.lock();
        state.ensure_writable()?;
        if !state.open_transactions.contains_key(&txn) {
            return Err(CoreError::invalid_operation(format!("{txn} was not begun")));
        }
        state.append(LogRecordKind::Operation, Some(txn), Some(state_provider_id));
        if let Some(count) = state.open_transactions.get_mut(&txn) {
            *count += 1;
        }
        Ok(())
    }

    async fn begin_and_commit(
        &self,
        txn: TransactionId,
        state_provider_id: StateProviderId,
        _operation: &OperationData,
    ) -> CoreResult<Lsn> {
        self.state.lock().ensure_writable()?;
        self.injected_write_failure()?;
        let mut state = self.state.lock();
        let lsn = state.append(
            LogRecordKind::SingleOperationTransaction,
            Some(txn),
            Some(state_provider_id),
        );
        state.commit_point(lsn);
        Ok(lsn)
    }

    async fn atomic_operation(
        &self,
        txn: TransactionId,
        state_provider_id: StateProviderId,
        _operation: &OperationData,
        redo_only: bool,
    ) -> CoreResult<Lsn> {
        self.state.lock().ensure_writable()?;
        self.injected_write_failure()?;
        let kind = if redo_only {
            LogRecordKind::AtomicRedoOperation
        } else {
            LogRecordKind::AtomicOperation
        };
        let mut state = self.state.lock();
        let lsn = state.append(kind, Some(txn), Some(state_provider_id));
        state.commit_point(lsn);
        Ok(lsn)
    }

    async fn commit_transaction(&self, txn: TransactionId) -> CoreResult<Lsn> {
        self.state.lock().ensure_writable()?;
        self.injected_write_failure()?;
        let mut state = self.state.lock();
        if state.open_transactions.remove(&txn).is_none() {
            return Err(CoreError::invalid_operation(format!("{txn} was not begun")));
        }
        let lsn = state.append(LogRecordKind::Commit, Some(txn), None);
        state.commit_point(lsn);
        Ok(lsn)
    }

    async fn abort_transaction(&self, txn: TransactionId) -> CoreResult<Lsn> {
        self.state.lock().ensure_writable()?;
        self.injected_write_failure()?;
        let mut state = self.state.lock();
        if state.open_transactions.remove(&txn).is_none() {
            return Err(CoreError::invalid_operation(format!("{txn} was not begun")));
        }
        Ok(state.append(LogRecordKind::Abort, Some(txn), None))
    }

    fn last_committed_lsn(&self) -> Lsn {
        Lsn::new(self.state.lock().last_committed)
    }

    fn last_stable_lsn(&self) -> Lsn {
        Lsn::new(self.state.lock().last_committed)
    }

    fn current_epoch(&self) -> Epoch {
        self.state.lock().epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopDelegate;

    #[async_trait]
    impl BecomeSecondaryDelegate for NoopDelegate {
        async fn become_active_secondary(&self) -> CoreResult<()> {
            Ok(())
        }
    }

    async fn primary_log() -> MemoryLogReplicator {
        let log = MemoryLogReplicator::new();
        log.open().await.unwrap();
        log.perform_recovery(&RecoveryInformation::default())
            .await
            .unwrap();
        log.become_primary().await.unwrap();
        log
    }

    #[tokio::test]
    async fn become_primary_appends_barrier() {
        let log = primary_log().await;
        assert_eq!(log.records()[0].kind, LogRecordKind::Barrier);
        assert_eq!(log.last_committed_lsn(), Lsn::new(1));
    }

    #[tokio::test]
    async fn writes_require_primary() {
        let log = MemoryLogReplicator::new();
        log.open().await.unwrap();
        log.become_idle_secondary().await.unwrap();

        let txn = TransactionId::new(1);
        let result = log.begin_transaction(txn, StateProviderId::new(1), &OperationData::default());
        assert_eq!(result, Err(CoreError::NotPrimary));
    }

    #[tokio::test]
    async fn transaction_records_in_order() {
        let log = primary_log().await;
        let txn = TransactionId::new(8);
        let sp = StateProviderId::new(2);
        let op = OperationData::redo(vec![1]);

        log.begin_transaction(txn, sp, &op).unwrap();
        log.add_operation(txn, sp, &op).unwrap();
        let lsn = log.commit_transaction(txn).await.unwrap();

        let kinds: Vec<_> = log.records().iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                LogRecordKind::Barrier,
                LogRecordKind::BeginTransaction,
                LogRecordKind::Operation,
                LogRecordKind::Commit
            ]
        );
        assert_eq!(log.last_committed_lsn(), lsn);
        assert_eq!(log.open_transaction_count(), 0);
    }

    #[tokio::test]
    async fn injected_write_failures_are_consumed_in_order() {
        let log = primary_log().await;
        log.fail_writes([CoreError::NoWriteQuorum]);
        let txn = TransactionId::new(3);
        let op = OperationData::redo(vec![1]);

        let first = log.begin_and_commit(txn, StateProviderId::new(1), &op).await;
        assert_eq!(first, Err(CoreError::NoWriteQuorum));
        assert!(log
            .begin_and_commit(txn, StateProviderId::new(1), &op)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn injected_step_failure_fires_once() {
        let log = MemoryLogReplicator::new();
        log.fail_step(LogStep::Open, CoreError::log_failure("corrupt"));

        assert!(log.open().await.is_err());
        assert!(log.open().await.is_ok());
        assert_eq!(log.steps(), vec![LogStep::Open, LogStep::Open]);
    }

    #[tokio::test]
    async fn active_secondary_calls_delegate() {
        let log = primary_log().await;
        log.become_active_secondary(&NoopDelegate).await.unwrap();
        assert_eq!(log.role(), ReplicaRole::ActiveSecondary);
    }

    #[tokio::test]
    async fn epoch_cannot_go_backwards() {
        let log = primary_log().await;
        log.update_epoch(Epoch::new(1, 2), Lsn::new(1)).await.unwrap();
        assert_eq!(log.current_epoch(), Epoch::new(1, 2));

        assert!(log.update_epoch(Epoch::new(1, 1), Lsn::new(1)).await.is_err());
    }

    #[tokio::test]
    async fn backup_and_restore() {
        let log = primary_log().await;
        let backup = log.backup("nightly").await.unwrap();
        assert_eq!(backup.lsn, Lsn::new(1));
        assert_eq!(backup.label, "nightly");

        log.restore(&backup).await.unwrap();
        assert_eq!(log.last_committed_lsn(), Lsn::new(1));
    }
}
