//! The interface transactions call back into.

use super::lock::LockContext;
use crate::error::CoreResult;
use crate::types::{Lsn, OperationData, ReplicaRole, StateProviderId, TransactionId};
use async_trait::async_trait;
use std::sync::Arc;

/// Appends transaction records to the replicated log on behalf of
/// transaction handles.
///
/// Handles hold the manager weakly; once it is dropped they fail with
/// [`CoreError::ObjectClosed`](crate::CoreError::ObjectClosed).
///
/// The synchronous methods are invoked while the caller holds its
/// transaction's state lock and must not block on I/O.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    /// Current replica role.
    fn role(&self) -> ReplicaRole;

    /// Logs the begin record of `txn` together with its first operation.
    fn begin_transaction(
        &self,
        txn: TransactionId,
        state_provider_id: StateProviderId,
        operation: &OperationData,
    ) -> CoreResult<()>;

    /// Logs begin, the only operation and commit of a single-operation
    /// transaction in one round trip. Returns the commit LSN.
    async fn begin_transaction_async(
        &self,
        txn: TransactionId,
        state_provider_id: StateProviderId,
        operation: &OperationData,
    ) -> CoreResult<Lsn>;

    /// Logs a further operation of a begun transaction.
    fn add_operation(
        &self,
        txn: TransactionId,
        state_provider_id: StateProviderId,
        operation: &OperationData,
    ) -> CoreResult<()>;

    /// Logs an atomic operation (begin, operation and commit folded).
    async fn add_atomic_operation(
        &self,
        txn: TransactionId,
        state_provider_id: StateProviderId,
        operation: &OperationData,
    ) -> CoreResult<Lsn>;

    /// Logs a redo-only atomic operation.
    async fn add_atomic_redo_operation(
        &self,
        txn: TransactionId,
        state_provider_id: StateProviderId,
        operation: &OperationData,
    ) -> CoreResult<Lsn>;

    /// Commits a begun transaction. Returns the commit LSN.
    async fn commit_transaction(&self, txn: TransactionId) -> CoreResult<Lsn>;

    /// Aborts a begun transaction. Returns the abort record's LSN.
    async fn abort_transaction(&self, txn: TransactionId) -> CoreResult<Lsn>;

    /// Registers a reader and returns its visibility sequence number.
    async fn register(&self) -> CoreResult<Lsn>;

    /// Releases a visibility sequence number obtained from [`register`](Self::register).
    fn unregister(&self, vsn: Lsn) -> CoreResult<()>;

    /// Fails unless `state_provider_id` is registered.
    fn error_if_state_provider_is_not_registered(
        &self,
        state_provider_id: StateProviderId,
        txn: TransactionId,
    ) -> CoreResult<()>;

    /// Releases the lock context of an atomic operation that failed fatally.
    fn single_operation_transaction_abort_unlock(
        &self,
        state_provider_id: StateProviderId,
        lock_context: Arc<dyn LockContext>,
    );
}
