//! # txnrep core
//!
//! Transaction handles and the version-removal protocol of the txnrep
//! transactional replicator.
//!
//! This crate provides:
//! - The per-transaction state machine
//! - Read/write transactions and atomic operations with commit/abort retry
//! - The `TransactionManager` interface handles call back into
//! - One-shot broadcast completions
//! - Reader registration and non-blocking version removal
//! - A feed of committed transactions
//!
//! ## Key invariants
//!
//! - A state-machine lock is never held across an await
//! - Terminal transaction states never transition further
//! - Transactions reference their manager weakly
//! - A completion completes exactly once

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change_feed;
mod completion;
mod config;
mod error;
mod transaction;
mod types;
mod version;

pub use change_feed::{CommitKind, TransactionChangeEvent, TransactionChangeFeed};
pub use completion::CompletionTask;
pub use config::TransactionConfig;
pub use error::{CoreError, CoreResult};
pub use transaction::{
    AbortReason, AtomicOperation, AtomicRedoOperation, LockContext, Transaction,
    TransactionIdGenerator, TransactionManager, TransactionOutcome, TransactionState,
    TransactionStateMachine, WeakTransaction,
};
pub use types::{Epoch, Lsn, OperationData, ReplicaRole, StateProviderId, TransactionId};
pub use version::{EnumerationCompletionResult, TryRemoveVersionResult, VersionManager};
