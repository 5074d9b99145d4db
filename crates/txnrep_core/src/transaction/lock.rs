//! Lock contexts held by transactions.

use crate::types::Lsn;
use std::fmt;

/// How a transaction ended, passed to the lock contexts it releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// Committed at the given LSN (`Lsn::INVALID` for a read-only commit).
    Committed(Lsn),
    /// Aborted, faulted or disposed without committing.
    Aborted,
}

/// A resource acquired while applying an operation.
///
/// A transaction releases each non-tracking context exactly once: when
/// ownership transfers at commit, or when the handle is disposed. Tracking
/// contexts only observe the transaction and are never unlocked by it.
pub trait LockContext: Send + Sync + fmt::Debug {
    /// Returns true if this context only tracks the transaction.
    fn is_tracking_context(&self) -> bool;

    /// Releases the resource.
    fn unlock(&self, outcome: TransactionOutcome);
}
