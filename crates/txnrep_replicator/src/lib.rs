//! # txnrep replicator
//!
//! Lifecycle and role management for a transactional replica.
//!
//! This crate provides:
//! - The transactional replicator (open, close, role changes)
//! - An activity gate that drains in-flight calls before close
//! - The replicated-log and state-manager seams, with in-memory versions
//! - Fault reporting to the hosting partition
//!
//! ## Lifecycle
//!
//! Open runs log open, state-manager open and log recovery in that order.
//! A failure at any stage closes the replicator. Role changes drive the log
//! first and the state manager second; leaving primary aborts the
//! transactions still active.
//!
//! ## Key invariants
//!
//! - No call is admitted once close starts
//! - The log is closed only if it was recovered, and always disposed
//! - A failed role change latches; later role changes fail fast

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod activity;
mod config;
mod log;
mod partition;
mod replicator;
mod state_manager;

pub use activity::{ActivityPhase, ActivityToken, ServiceActivity};
pub use config::ReplicatorConfig;
pub use log::{
    BackupInfo, BecomeSecondaryDelegate, LogRecord, LogRecordKind, LogReplicator, LogStep,
    MemoryLogReplicator, RecoveryInformation,
};
pub use partition::{FaultType, MemoryPartition, StatefulPartition};
pub use replicator::{ReplicatorInfo, TransactionalReplicator};
pub use state_manager::{
    MemoryStateManager, NamedStateProvider, RegisteredStateProvider, StateManager, StateProvider,
};
