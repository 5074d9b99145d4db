//! Property tests of role changes against the in-memory log.

use proptest::prelude::*;
use std::sync::Arc;
use txnrep_core::{AbortReason, ReplicaRole, Transaction, TransactionState};
use txnrep_replicator::{
    MemoryLogReplicator, MemoryPartition, MemoryStateManager, NamedStateProvider,
    ReplicatorConfig, TransactionalReplicator,
};

type Replicator = TransactionalReplicator<MemoryLogReplicator, MemoryStateManager>;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap()
}

fn role_strategy() -> impl Strategy<Value = ReplicaRole> {
    prop_oneof![
        Just(ReplicaRole::Primary),
        Just(ReplicaRole::IdleSecondary),
        Just(ReplicaRole::ActiveSecondary),
    ]
}

/// A role to change to and whether to leave a two-operation transaction
/// open before the change.
fn step_strategy() -> impl Strategy<Value = (ReplicaRole, bool)> {
    (role_strategy(), any::<bool>())
}

async fn open_replicator() -> (Arc<Replicator>, Arc<MemoryLogReplicator>, Arc<MemoryPartition>) {
    let log = Arc::new(MemoryLogReplicator::new());
    let partition = Arc::new(MemoryPartition::new());
    let replicator = TransactionalReplicator::new(
        ReplicatorConfig::default(),
        Arc::clone(&log),
        Arc::new(MemoryStateManager::new()),
        partition.clone(),
    );
    replicator.open().await.unwrap();
    (replicator, log, partition)
}

async fn begin_two_operations(replicator: &Arc<Replicator>, tag: usize) -> Transaction {
    let txn = replicator.create_transaction().unwrap();
    for name in ["a", "b"] {
        replicator
            .add(&txn, NamedStateProvider::new(format!("{name}{tag}")))
            .await
            .unwrap();
    }
    txn
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn leaving_primary_aborts_and_forgets_open_transactions(
        steps in prop::collection::vec(step_strategy(), 1..8)
    ) {
        runtime().block_on(async {
            let (replicator, log, partition) = open_replicator().await;
            let mut role = ReplicaRole::Unknown;
            let mut open: Vec<Transaction> = Vec::new();

            for (i, (next, leave_open)) in steps.iter().copied().enumerate() {
                if role == ReplicaRole::Primary && leave_open {
                    open.push(begin_two_operations(&replicator, i).await);
                }

                replicator.change_role(next).await.unwrap();

                if role == ReplicaRole::Primary && next != ReplicaRole::Primary {
                    for txn in open.drain(..) {
                        assert_eq!(txn.state(), TransactionState::Aborted);
                        assert_eq!(txn.abort_reason(), AbortReason::SystemAborted);
                    }
                    assert_eq!(replicator.tracked_transaction_count(), 0);
                    assert_eq!(log.open_transaction_count(), 0);
                }
                role = next;
            }

            assert_eq!(log.role(), role);
            assert_eq!(replicator.tracked_transaction_count(), open.len());
            assert!(!replicator.is_faulted());
            assert!(partition.faults().is_empty());
        });
    }
}
