//! Transaction handles and their state machine.
//!
//! - [`TransactionStateMachine`]: legal transitions of one transaction
//! - [`Transaction`]: read/write transaction with commit/abort retry
//! - [`AtomicOperation`], [`AtomicRedoOperation`]: single-operation transactions
//! - [`TransactionManager`]: what handles call back into
//! - [`TransactionIdGenerator`]: process-wide id source

mod atomic;
mod base;
mod id;
mod lock;
mod manager;
mod state;
#[cfg(test)]
pub(crate) mod testing;
#[allow(clippy::module_inception)]
mod transaction;

pub use atomic::{AtomicOperation, AtomicRedoOperation};
pub use id::TransactionIdGenerator;
pub use lock::{LockContext, TransactionOutcome};
pub use manager::TransactionManager;
pub use state::{AbortReason, TransactionState, TransactionStateMachine};
pub use transaction::{Transaction, WeakTransaction};
