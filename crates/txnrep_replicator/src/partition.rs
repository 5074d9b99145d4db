//! Hosting partition collaborator.

use parking_lot::Mutex;
use tracing::warn;

/// Severity of a reported fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultType {
    /// Restart the replica.
    Transient,
    /// Drop the replica and rebuild it elsewhere.
    Permanent,
}

/// The partition hosting the replicator.
pub trait StatefulPartition: Send + Sync {
    /// Asks the host to restart or rebuild the replica.
    fn report_fault(&self, fault: FaultType);
}

/// Partition that records reported faults.
#[derive(Debug, Default)]
pub struct MemoryPartition {
    faults: Mutex<Vec<FaultType>>,
}

impl MemoryPartition {
    /// Creates a partition with no faults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Faults reported so far.
    pub fn faults(&self) -> Vec<FaultType> {
        self.faults.lock().clone()
    }
}

impl StatefulPartition for MemoryPartition {
    fn report_fault(&self, fault: FaultType) {
        warn!(?fault, "fault reported to partition");
        self.faults.lock().push(fault);
    }
}
