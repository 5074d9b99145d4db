//! Test fixtures and replicator helpers.
//!
//! Provides a replicator wired to the in-memory log, state manager and
//! partition, with handles on each so tests can inject failures and
//! inspect what happened.

use std::ops::Deref;
use std::sync::Arc;
use txnrep_core::{CoreError, CoreResult, Lsn, ReplicaRole, StateProviderId};
use txnrep_replicator::{
    MemoryLogReplicator, MemoryPartition, MemoryStateManager, NamedStateProvider,
    RecoveryInformation, ReplicatorConfig, TransactionalReplicator,
};

/// Replicator over the in-memory collaborators.
pub type MemoryReplicator = TransactionalReplicator<MemoryLogReplicator, MemoryStateManager>;

/// A replicator plus its collaborators.
pub struct TestReplicator {
    /// The replicator.
    pub replicator: Arc<MemoryReplicator>,
    /// The log behind it.
    pub log: Arc<MemoryLogReplicator>,
    /// The state manager behind it.
    pub state_manager: Arc<MemoryStateManager>,
    /// The partition it reports faults to.
    pub partition: Arc<MemoryPartition>,
}

impl TestReplicator {
    /// Starts building a fixture.
    pub fn builder() -> TestReplicatorBuilder {
        TestReplicatorBuilder::default()
    }

    /// Creates an unopened fixture with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a fixture that is open and primary.
    pub async fn open_primary() -> Self {
        Self::builder().open_primary().await
    }

    /// Registers a provider called `name` in its own transaction.
    ///
    /// # Panics
    ///
    /// Panics if registration or commit fails.
    pub async fn register_provider(&self, name: &str) -> StateProviderId {
        let txn = self
            .replicator
            .create_transaction()
            .expect("Failed to create transaction");
        let id = self
            .replicator
            .add(&txn, NamedStateProvider::new(name))
            .await
            .expect("Failed to add state provider");
        txn.commit().await.expect("Failed to commit registration");
        txn.dispose().await;
        id
    }

    /// Registers every name in one transaction. Returns the commit LSN.
    pub async fn commit_providers(&self, names: &[&str]) -> CoreResult<Lsn> {
        let txn = self.replicator.create_transaction()?;
        for name in names {
            if let Err(e) = self.replicator.add(&txn, NamedStateProvider::new(*name)).await {
                txn.dispose().await;
                return Err(e);
            }
        }
        let result = txn.commit().await;
        txn.dispose().await;
        result
    }
}

impl Default for TestReplicator {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for TestReplicator {
    type Target = Arc<MemoryReplicator>;

    fn deref(&self) -> &Self::Target {
        &self.replicator
    }
}

/// Builder for [`TestReplicator`].
#[derive(Debug, Default)]
pub struct TestReplicatorBuilder {
    config: ReplicatorConfig,
    write_failures: Vec<CoreError>,
    recovery: RecoveryInformation,
}

impl TestReplicatorBuilder {
    /// Uses `config` for the replicator.
    pub fn with_config(mut self, config: ReplicatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Makes the first log writes fail with `errors`, in order.
    pub fn with_write_failures(mut self, errors: impl IntoIterator<Item = CoreError>) -> Self {
        self.write_failures.extend(errors);
        self
    }

    /// Sets what the log reports on open.
    pub fn with_recovery_information(mut self, recovery: RecoveryInformation) -> Self {
        self.recovery = recovery;
        self
    }

    /// Builds an unopened fixture.
    pub fn build(self) -> TestReplicator {
        let log = Arc::new(MemoryLogReplicator::new());
        log.set_recovery_information(self.recovery);
        log.fail_writes(self.write_failures);

        let state_manager = Arc::new(MemoryStateManager::new());
        let partition = Arc::new(MemoryPartition::new());
        let replicator = TransactionalReplicator::new(
            self.config,
            Arc::clone(&log),
            Arc::clone(&state_manager),
            partition.clone(),
        );
        TestReplicator {
            replicator,
            log,
            state_manager,
            partition,
        }
    }

    /// Builds and opens the fixture.
    ///
    /// # Panics
    ///
    /// Panics if open fails.
    pub async fn open(self) -> TestReplicator {
        let fixture = self.build();
        fixture
            .replicator
            .open()
            .await
            .expect("Failed to open replicator");
        fixture
    }

    /// Builds, opens and promotes the fixture to primary.
    ///
    /// # Panics
    ///
    /// Panics if open or the role change fails.
    pub async fn open_primary(self) -> TestReplicator {
        let fixture = self.open().await;
        fixture
            .replicator
            .change_role(ReplicaRole::Primary)
            .await
            .expect("Failed to become primary");
        fixture
    }
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// A primary with `provider_count` registered providers named
    /// `provider-0`, `provider-1` and so on.
    pub async fn populated_primary(provider_count: usize) -> TestReplicator {
        let fixture = TestReplicator::open_primary().await;
        for i in 0..provider_count {
            fixture.register_provider(&format!("provider-{i}")).await;
        }
        fixture
    }
}
