//! State-provider manager collaborator.
//!
//! Registrations and removals are transactional: [`MemoryStateManager`]
//! stages them behind a lock context and applies them only when the
//! transaction commits.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};
use txnrep_core::{
    CoreError, CoreResult, LockContext, OperationData, ReplicaRole, StateProviderId, Transaction,
    TransactionOutcome,
};

/// A replicated component whose state is changed by transactions.
pub trait StateProvider: Send + Sync + fmt::Debug {
    /// Unique name of the provider.
    fn name(&self) -> &str;
}

/// A registered provider and its id.
#[derive(Debug, Clone)]
pub struct RegisteredStateProvider {
    /// Id assigned on registration.
    pub id: StateProviderId,
    /// The provider.
    pub provider: Arc<dyn StateProvider>,
}

/// Interface to the state-provider manager.
#[async_trait]
pub trait StateManager: Send + Sync {
    /// Opens the manager after the log reported its recovery needs.
    async fn open(&self, complete_checkpoint: bool, cleanup_restore: bool) -> CoreResult<()>;

    /// Changes the role of every provider.
    async fn change_role(&self, role: ReplicaRole) -> CoreResult<()>;

    /// Closes the manager.
    async fn close(&self) -> CoreResult<()>;

    /// Looks up a committed provider by name.
    fn get(&self, name: &str) -> CoreResult<RegisteredStateProvider>;

    /// Registers `provider` as part of `txn`.
    async fn add(&self, txn: &Transaction, provider: Arc<dyn StateProvider>) -> CoreResult<StateProviderId>;

    /// Unregisters the provider called `name` as part of `txn`.
    async fn remove(&self, txn: &Transaction, name: &str) -> CoreResult<()>;

    /// Returns the provider called `provider.name()`, registering `provider`
    /// as part of `txn` if there is none. The flag is true if it was added.
    async fn get_or_add(
        &self,
        txn: &Transaction,
        provider: Arc<dyn StateProvider>,
    ) -> CoreResult<(RegisteredStateProvider, bool)>;

    /// Committed providers ordered by name.
    fn create_enumerator(&self) -> CoreResult<Vec<RegisteredStateProvider>>;

    /// Returns true if `id` is registered or is the state manager itself.
    fn is_registered(&self, id: StateProviderId) -> bool;

    /// Releases the lock context of a failed atomic operation.
    fn single_operation_transaction_abort_unlock(
        &self,
        state_provider_id: StateProviderId,
        lock_context: Arc<dyn LockContext>,
    );
}

#[derive(Debug)]
enum StagedChange {
    Add(RegisteredStateProvider),
    Remove(StateProviderId),
}

#[derive(Debug, Default)]
struct Registry {
    committed: BTreeMap<String, RegisteredStateProvider>,
    staged: HashMap<String, StagedChange>,
}

/// Lock on one name, released when the owning transaction ends.
#[derive(Debug)]
struct NameLock {
    name: String,
    registry: Weak<RwLock<Registry>>,
}

impl LockContext for NameLock {
    fn is_tracking_context(&self) -> bool {
        false
    }

    fn unlock(&self, outcome: TransactionOutcome) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = registry.write();
        let Some(change) = registry.staged.remove(&self.name) else {
            return;
        };
        match (outcome, change) {
            (TransactionOutcome::Committed(lsn), StagedChange::Add(entry)) => {
                debug!(name = %self.name, id = %entry.id, %lsn, "state provider added");
                registry.committed.insert(self.name.clone(), entry);
            }
            (TransactionOutcome::Committed(lsn), StagedChange::Remove(id)) => {
                debug!(name = %self.name, %id, %lsn, "state provider removed");
                registry.committed.remove(&self.name);
            }
            (TransactionOutcome::Aborted, _) => {
                debug!(name = %self.name, "staged change discarded");
            }
        }
    }
}

/// In-memory state manager.
#[derive(Debug)]
pub struct MemoryStateManager {
    registry: Arc<RwLock<Registry>>,
    next_id: AtomicI64,
    role: Mutex<ReplicaRole>,
    roles: Mutex<Vec<ReplicaRole>>,
    open_flags: Mutex<Option<(bool, bool)>>,
    closed: Mutex<bool>,
    fail_role: Mutex<Option<(ReplicaRole, CoreError)>>,
}

impl MemoryStateManager {
    /// Creates a manager with no providers.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry::default())),
            next_id: AtomicI64::new(StateProviderId::STATE_MANAGER.as_i64() + 1),
            role: Mutex::new(ReplicaRole::Unknown),
            roles: Mutex::new(Vec::new()),
            open_flags: Mutex::new(None),
            closed: Mutex::new(false),
            fail_role: Mutex::new(None),
        }
    }

    /// Makes the next change to `role` fail with `error`.
    pub fn fail_role_change(&self, role: ReplicaRole, error: CoreError) {
        *self.fail_role.lock() = Some((role, error));
    }

    /// Current role.
    pub fn role(&self) -> ReplicaRole {
        *self.role.lock()
    }

    /// Every role change applied, in order.
    pub fn role_history(&self) -> Vec<ReplicaRole> {
        self.roles.lock().clone()
    }

    /// Flags passed to [`StateManager::open`], if it was called.
    pub fn open_flags(&self) -> Option<(bool, bool)> {
        *self.open_flags.lock()
    }

    /// Returns true once closed.
    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    /// Number of uncommitted adds and removes.
    pub fn staged_count(&self) -> usize {
        self.registry.read().staged.len()
    }

    fn stage(
        &self,
        txn: &Transaction,
        name: &str,
        change: StagedChange,
        redo: &'static [u8],
    ) -> CoreResult<()> {
        {
            let mut registry = self.registry.write();
            if registry.staged.contains_key(name) {
                return Err(CoreError::invalid_operation(format!(
                    "state provider {name} has an uncommitted change"
                )));
            }
            registry.staged.insert(name.to_string(), change);
        }

        let lock: Arc<dyn LockContext> = Arc::new(NameLock {
            name: name.to_string(),
            registry: Arc::downgrade(&self.registry),
        });
        let operation = OperationData::redo(Bytes::from_static(redo))
            .with_metadata(Bytes::copy_from_slice(name.as_bytes()));

        if let Err(e) = txn.add_operation(StateProviderId::STATE_MANAGER, operation, Some(lock)) {
            self.registry.write().staged.remove(name);
            return Err(e);
        }
        Ok(())
    }
}

impl Default for MemoryStateManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateManager for MemoryStateManager {
    async fn open(&self, complete_checkpoint: bool, cleanup_restore: bool) -> CoreResult<()> {
        info!(complete_checkpoint, cleanup_restore, "opening state manager");
        if cleanup_restore {
            let mut registry = self.registry.write();
            registry.committed.clear();
            registry.staged.clear();
        }
        *self.open_flags.lock() = Some((complete_checkpoint, cleanup_restore));
        Ok(())
    }

    async fn change_role(&self, role: ReplicaRole) -> CoreResult<()> {
        let injected = {
            let mut fail_role = self.fail_role.lock();
            match fail_role.take() {
                Some((target, error)) if target == role => Some(error),
                other => {
                    *fail_role = other;
                    None
                }
            }
        };
        if let Some(error) = injected {
            return Err(error);
        }

        *self.role.lock() = role;
        self.roles.lock().push(role);
        Ok(())
    }

    async fn close(&self) -> CoreResult<()> {
        *self.closed.lock() = true;
        Ok(())
    }

    fn get(&self, name: &str) -> CoreResult<RegisteredStateProvider> {
        self.registry
            .read()
            .committed
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::not_registered(name))
    }

    async fn add(&self, txn: &Transaction, provider: Arc<dyn StateProvider>) -> CoreResult<StateProviderId> {
        let name = provider.name().to_string();
        if self.registry.read().committed.contains_key(&name) {
            return Err(CoreError::StateProviderAlreadyExists { name });
        }
        let id = StateProviderId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        let entry = RegisteredStateProvider { id, provider };
        self.stage(txn, &name, StagedChange::Add(entry), b"add")?;
        Ok(id)
    }

    async fn remove(&self, txn: &Transaction, name: &str) -> CoreResult<()> {
        let id = self.get(name)?.id;
        self.stage(txn, name, StagedChange::Remove(id), b"remove")
    }

    async fn get_or_add(
        &self,
        txn: &Transaction,
        provider: Arc<dyn StateProvider>,
    ) -> CoreResult<(RegisteredStateProvider, bool)> {
        if let Ok(existing) = self.get(provider.name()) {
            return Ok((existing, false));
        }
        let id = self.add(txn, Arc::clone(&provider)).await?;
        Ok((RegisteredStateProvider { id, provider }, true))
    }

    fn create_enumerator(&self) -> CoreResult<Vec<RegisteredStateProvider>> {
        Ok(self.registry.read().committed.values().cloned().collect())
    }

    fn is_registered(&self, id: StateProviderId) -> bool {
        id == StateProviderId::STATE_MANAGER
            || self
                .registry
                .read()
                .committed
                .values()
                .any(|entry| entry.id == id)
    }

    fn single_operation_transaction_abort_unlock(
        &self,
        state_provider_id: StateProviderId,
        lock_context: Arc<dyn LockContext>,
    ) {
        debug!(sp = %state_provider_id, "releasing lock of failed atomic operation");
        lock_context.unlock(TransactionOutcome::Aborted);
    }
}

/// Minimal provider identified by name only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedStateProvider {
    name: String,
}

impl NamedStateProvider {
    /// Creates a provider called `name`.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { name: name.into() })
    }
}

impl StateProvider for NamedStateProvider {
    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_manager_is_always_registered() {
        let manager = MemoryStateManager::new();
        assert!(manager.is_registered(StateProviderId::STATE_MANAGER));
        assert!(!manager.is_registered(StateProviderId::new(42)));
    }

    #[test]
    fn unknown_name_is_not_registered() {
        let manager = MemoryStateManager::new();
        assert!(matches!(
            manager.get("missing"),
            Err(CoreError::StateProviderNotRegistered { .. })
        ));
    }

    #[test]
    fn name_lock_applies_on_commit_only() {
        let manager = MemoryStateManager::new();
        let entry = RegisteredStateProvider {
            id: StateProviderId::new(5),
            provider: NamedStateProvider::new("orders"),
        };
        manager
            .registry
            .write()
            .staged
            .insert("orders".into(), StagedChange::Add(entry));
        let lock = NameLock {
            name: "orders".into(),
            registry: Arc::downgrade(&manager.registry),
        };

        lock.unlock(TransactionOutcome::Committed(txnrep_core::Lsn::new(9)));
        assert_eq!(manager.get("orders").unwrap().id, StateProviderId::new(5));
        assert!(manager.is_registered(StateProviderId::new(5)));
        assert_eq!(manager.staged_count(), 0);
    }

    #[test]
    fn aborted_change_is_discarded() {
        let manager = MemoryStateManager::new();
        manager.registry.write().staged.insert(
            "orders".into(),
            StagedChange::Remove(StateProviderId::new(5)),
        );
        let lock = NameLock {
            name: "orders".into(),
            registry: Arc::downgrade(&manager.registry),
        };

        lock.unlock(TransactionOutcome::Aborted);
        assert_eq!(manager.staged_count(), 0);
    }

    #[tokio::test]
    async fn injected_role_failure_matches_target_role() {
        let manager = MemoryStateManager::new();
        manager.fail_role_change(ReplicaRole::Primary, CoreError::log_failure("boom"));

        manager.change_role(ReplicaRole::IdleSecondary).await.unwrap();
        assert!(manager.change_role(ReplicaRole::Primary).await.is_err());
        manager.change_role(ReplicaRole::Primary).await.unwrap();
        assert_eq!(
            manager.role_history(),
            vec![ReplicaRole::IdleSecondary, ReplicaRole::Primary]
        );
    }

    #[tokio::test]
    async fn cleanup_restore_drops_providers() {
        let manager = MemoryStateManager::new();
        manager.registry.write().committed.insert(
            "a".into(),
            RegisteredStateProvider {
                id: StateProviderId::new(1),
                provider: NamedStateProvider::new("a"),
            },
        );

        manager.open(false, true).await.unwrap();
        assert!(manager.create_enumerator().unwrap().is_empty());
        assert_eq!(manager.open_flags(), Some((false, true)));
    }
}
