//! Error types for txnrep core.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors surfaced by transactions, the version manager and the replicator.
///
/// The variants form a status taxonomy: fatal statuses are surfaced
/// immediately, retriable statuses (see [`CoreError::is_retriable`]) are
/// retried with backoff by commit/abort, and `Timeout`/`Cancelled` return a
/// committing transaction to `Active`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// The replicator (or the transaction manager behind a handle) is closed or closing.
    #[error("object closed")]
    ObjectClosed,

    /// The transaction is not in a state that allows the requested operation.
    #[error("transaction is not active")]
    TransactionNotActive,

    /// The same transaction handle is used by more than one caller at a time.
    #[error("concurrent use of the same transaction from multiple callers")]
    ConcurrentTransactionUse,

    /// The transaction was aborted by the system rather than by the user.
    #[error("transaction was aborted by the system")]
    TransactionAbortedBySystem,

    /// A write was attempted on a replica that is not primary.
    #[error("replica is not primary")]
    NotPrimary,

    /// The requested role is not a valid target.
    #[error("invalid replica role: {role}")]
    InvalidRole {
        /// Name of the rejected role.
        role: String,
    },

    /// Not enough replicas acknowledged the write.
    #[error("no write quorum")]
    NoWriteQuorum,

    /// A reconfiguration is in progress.
    #[error("reconfiguration pending")]
    ReconfigurationPending,

    /// The replication queue is full.
    #[error("replication queue full")]
    ReplicationQueueFull,

    /// The service is temporarily overloaded.
    #[error("service too busy")]
    ServiceTooBusy,

    /// The caller's timeout elapsed.
    #[error("operation timed out")]
    Timeout,

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The replicator is in an unexpected state (for example after a failed role change).
    #[error("unexpected: {message}")]
    Unexpected {
        /// Description of the unexpected condition.
        message: String,
    },

    /// No state provider is registered under the given name or id.
    #[error("state provider not registered: {name}")]
    StateProviderNotRegistered {
        /// Name or id of the missing state provider.
        name: String,
    },

    /// A state provider with the given name already exists.
    #[error("state provider already exists: {name}")]
    StateProviderAlreadyExists {
        /// Name of the existing state provider.
        name: String,
    },

    /// Invalid operation.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// The log layer failed.
    #[error("log failure: {message}")]
    LogFailure {
        /// Description of the failure.
        message: String,
    },
}

impl CoreError {
    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an unexpected-state error.
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected {
            message: message.into(),
        }
    }

    /// Creates a log failure error.
    pub fn log_failure(message: impl Into<String>) -> Self {
        Self::LogFailure {
            message: message.into(),
        }
    }

    /// Creates a state-provider-not-registered error.
    pub fn not_registered(name: impl Into<String>) -> Self {
        Self::StateProviderNotRegistered { name: name.into() }
    }

    /// Returns true if the status is transient and the operation may be retried.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::NoWriteQuorum
                | Self::ReconfigurationPending
                | Self::ReplicationQueueFull
                | Self::ServiceTooBusy
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_classification() {
        assert!(CoreError::NoWriteQuorum.is_retriable());
        assert!(CoreError::ReconfigurationPending.is_retriable());
        assert!(CoreError::ReplicationQueueFull.is_retriable());
        assert!(CoreError::ServiceTooBusy.is_retriable());

        assert!(!CoreError::ObjectClosed.is_retriable());
        assert!(!CoreError::NotPrimary.is_retriable());
        assert!(!CoreError::Timeout.is_retriable());
        assert!(!CoreError::Cancelled.is_retriable());
        assert!(!CoreError::log_failure("disk").is_retriable());
    }

    #[test]
    fn error_display() {
        let err = CoreError::TransactionAbortedBySystem;
        assert_eq!(err.to_string(), "transaction was aborted by the system");

        let err = CoreError::not_registered("users");
        assert!(err.to_string().contains("users"));
    }
}
