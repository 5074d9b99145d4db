//! Configuration for the replicator.

use std::time::Duration;
use txnrep_core::TransactionConfig;

/// Configuration for a [`TransactionalReplicator`](crate::TransactionalReplicator).
#[derive(Debug, Clone)]
pub struct ReplicatorConfig {
    /// Settings handed to every transaction.
    pub transaction: TransactionConfig,
    /// How long close waits for in-flight calls.
    pub close_drain_timeout: Duration,
    /// Commit events kept for polling.
    pub change_feed_history: usize,
}

impl ReplicatorConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            transaction: TransactionConfig::default(),
            close_drain_timeout: Duration::from_secs(30),
            change_feed_history: 10_000,
        }
    }

    /// Sets the transaction configuration.
    pub fn with_transaction(mut self, transaction: TransactionConfig) -> Self {
        self.transaction = transaction;
        self
    }

    /// Sets the close drain timeout.
    pub fn with_close_drain_timeout(mut self, timeout: Duration) -> Self {
        self.close_drain_timeout = timeout;
        self
    }

    /// Sets the change-feed history size.
    pub fn with_change_feed_history(mut self, events: usize) -> Self {
        self.change_feed_history = events;
        self
    }
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self::new()
    }
}
