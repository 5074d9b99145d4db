//! Core type definitions for txnrep.

use bytes::Bytes;
use std::fmt;

/// Unique identifier for a transaction handle.
///
/// The sign encodes the kind: positive ids belong to read/write
/// transactions, negative ids to atomic operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub i64);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Returns true if this id belongs to an atomic operation.
    #[must_use]
    pub const fn is_atomic_operation(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Log sequence number: position of a record in the replicated log.
///
/// Also used as a visibility sequence number (VSN) for readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub i64);

impl Lsn {
    /// Marker for "no sequence number assigned".
    pub const INVALID: Lsn = Lsn(-1);

    /// Sequence number of the empty log.
    pub const ZERO: Lsn = Lsn(0);

    /// Creates a new LSN.
    #[must_use]
    pub const fn new(lsn: i64) -> Self {
        Self(lsn)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Returns the next LSN.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns true if this is a real position in the log.
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lsn:{}", self.0)
    }
}

/// Identifier of a registered state provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateProviderId(pub i64);

impl StateProviderId {
    /// The state manager itself. Always registered.
    pub const STATE_MANAGER: StateProviderId = StateProviderId(0);

    /// Creates a new state provider ID.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for StateProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sp:{}", self.0)
    }
}

/// Replica configuration epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Epoch {
    /// Incremented whenever the partition suffers data loss.
    pub data_loss_number: i64,
    /// Incremented on every reconfiguration.
    pub configuration_number: i64,
}

impl Epoch {
    /// Creates a new epoch.
    #[must_use]
    pub const fn new(data_loss_number: i64, configuration_number: i64) -> Self {
        Self {
            data_loss_number,
            configuration_number,
        }
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.data_loss_number, self.configuration_number)
    }
}

/// Replica role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReplicaRole {
    /// Role not yet assigned.
    #[default]
    Unknown,
    /// Replica is being removed.
    None,
    /// Replica accepts writes.
    Primary,
    /// Secondary that is building state and not yet in the write quorum.
    IdleSecondary,
    /// Secondary that participates in the write quorum.
    ActiveSecondary,
}

impl ReplicaRole {
    /// Returns true if the role is either kind of secondary.
    #[must_use]
    pub const fn is_secondary(self) -> bool {
        matches!(self, ReplicaRole::IdleSecondary | ReplicaRole::ActiveSecondary)
    }
}

impl fmt::Display for ReplicaRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplicaRole::Unknown => "unknown",
            ReplicaRole::None => "none",
            ReplicaRole::Primary => "primary",
            ReplicaRole::IdleSecondary => "idle-secondary",
            ReplicaRole::ActiveSecondary => "active-secondary",
        };
        f.write_str(name)
    }
}

/// Opaque payload of one state-provider operation.
///
/// The replicator never interprets these buffers; the state provider that
/// produced them is responsible for applying and undoing them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OperationData {
    /// Operation metadata, replicated and logged.
    pub metadata: Option<Bytes>,
    /// Undo information, logged on the primary only.
    pub undo: Option<Bytes>,
    /// Redo information, replicated and logged.
    pub redo: Option<Bytes>,
}

impl OperationData {
    /// Creates operation data with only a redo payload.
    pub fn redo(redo: impl Into<Bytes>) -> Self {
        Self {
            metadata: None,
            undo: None,
            redo: Some(redo.into()),
        }
    }

    /// Sets the metadata payload.
    #[must_use]
    pub fn with_metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    /// Sets the undo payload.
    #[must_use]
    pub fn with_undo(mut self, undo: impl Into<Bytes>) -> Self {
        self.undo = Some(undo.into());
        self
    }

    /// Total number of payload bytes.
    pub fn len(&self) -> usize {
        [&self.metadata, &self.undo, &self.redo]
            .iter()
            .filter_map(|b| b.as_ref().map(Bytes::len))
            .sum()
    }

    /// Returns true if no payload is attached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
