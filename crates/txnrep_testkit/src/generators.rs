//! Property-based test generators using proptest.
//!
//! Provides strategies for generating operations, failures, role
//! sequences and transaction plans.

use proptest::prelude::*;
use txnrep_core::{CoreError, OperationData, ReplicaRole};

/// Strategy for generating valid state provider names.
pub fn provider_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for generating operation payloads.
pub fn operation_data_strategy() -> impl Strategy<Value = OperationData> {
    (
        prop::collection::vec(any::<u8>(), 1..256),
        prop::option::of(prop::collection::vec(any::<u8>(), 0..64)),
        prop::option::of(prop::collection::vec(any::<u8>(), 0..64)),
    )
        .prop_map(|(redo, metadata, undo)| {
            let mut operation = OperationData::redo(redo);
            if let Some(metadata) = metadata {
                operation = operation.with_metadata(metadata);
            }
            if let Some(undo) = undo {
                operation = operation.with_undo(undo);
            }
            operation
        })
}

/// Strategy for generating errors a commit retries.
pub fn retriable_error_strategy() -> impl Strategy<Value = CoreError> {
    prop_oneof![
        Just(CoreError::NoWriteQuorum),
        Just(CoreError::ReconfigurationPending),
        Just(CoreError::ReplicationQueueFull),
        Just(CoreError::ServiceTooBusy),
    ]
}

/// Strategy for generating errors that fault a commit.
pub fn fatal_error_strategy() -> impl Strategy<Value = CoreError> {
    prop_oneof![
        Just(CoreError::NotPrimary),
        "[a-z ]{1,20}".prop_map(CoreError::log_failure),
        "[a-z ]{1,20}".prop_map(CoreError::unexpected),
    ]
}

/// Strategy for generating roles a replicator can change to.
pub fn target_role_strategy() -> impl Strategy<Value = ReplicaRole> {
    prop_oneof![
        Just(ReplicaRole::Primary),
        Just(ReplicaRole::IdleSecondary),
        Just(ReplicaRole::ActiveSecondary),
    ]
}

/// Strategy for generating a sequence of role changes.
pub fn role_sequence_strategy(max_len: usize) -> impl Strategy<Value = Vec<ReplicaRole>> {
    prop::collection::vec(target_role_strategy(), 1..=max_len.max(1))
}

/// A transaction to run against a replicator.
#[derive(Debug, Clone)]
pub struct TransactionPlan {
    /// Providers to register, one operation each.
    pub provider_names: Vec<String>,
    /// Commit if true, abort otherwise.
    pub commit: bool,
}

/// Strategy for generating a transaction plan with distinct names.
pub fn transaction_plan_strategy(max_operations: usize) -> impl Strategy<Value = TransactionPlan> {
    (
        prop::collection::btree_set(provider_name_strategy(), 1..=max_operations.max(1)),
        any::<bool>(),
    )
        .prop_map(|(names, commit)| TransactionPlan {
            provider_names: names.into_iter().collect(),
            commit,
        })
}

/// Strategy for generating plans whose names never repeat across plans.
pub fn transaction_plans_strategy(
    max_plans: usize,
    max_operations: usize,
) -> impl Strategy<Value = Vec<TransactionPlan>> {
    prop::collection::vec(transaction_plan_strategy(max_operations), 1..=max_plans.max(1))
        .prop_map(|plans| {
            plans
                .into_iter()
                .enumerate()
                .map(|(i, plan)| TransactionPlan {
                    provider_names: plan
                        .provider_names
                        .into_iter()
                        .map(|name| format!("p{i}_{name}"))
                        .collect(),
                    commit: plan.commit,
                })
                .collect()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use txnrep_core::{Lsn, TransactionState};

    use crate::fixtures::TestReplicator;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
    }

    proptest! {
        #[test]
        fn generated_names_are_valid(name in provider_name_strategy()) {
            prop_assert!(!name.is_empty());
            prop_assert!(name.len() <= 16);
        }

        #[test]
        fn retriable_errors_are_retriable(error in retriable_error_strategy()) {
            prop_assert!(error.is_retriable());
        }

        #[test]
        fn fatal_errors_are_not_retriable(error in fatal_error_strategy()) {
            prop_assert!(!error.is_retriable());
        }

        #[test]
        fn operation_payloads_carry_redo(operation in operation_data_strategy()) {
            prop_assert!(operation.redo.is_some());
            prop_assert!(!operation.is_empty());
        }

        #[test]
        fn plans_never_share_names(plans in transaction_plans_strategy(5, 4)) {
            let mut seen = HashSet::new();
            for plan in &plans {
                for name in &plan.provider_names {
                    prop_assert!(seen.insert(name.clone()));
                }
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn only_committed_plans_become_visible(plans in transaction_plans_strategy(4, 3)) {
            runtime().block_on(async {
                let fixture = TestReplicator::open_primary().await;
                let mut last_lsn = Lsn::ZERO;

                for plan in &plans {
                    let txn = fixture.create_transaction().unwrap();
                    for name in &plan.provider_names {
                        fixture
                            .add(&txn, txnrep_replicator::NamedStateProvider::new(name.clone()))
                            .await
                            .unwrap();
                    }
                    if plan.commit {
                        let lsn = txn.commit().await.unwrap();
                        assert!(lsn > last_lsn);
                        last_lsn = lsn;
                        assert_eq!(txn.state(), TransactionState::Committed);
                    } else {
                        txn.abort_async().await.unwrap();
                        assert_eq!(txn.state(), TransactionState::Aborted);
                    }
                    txn.dispose().await;
                }

                for plan in &plans {
                    for name in &plan.provider_names {
                        assert_eq!(fixture.get(name).is_ok(), plan.commit);
                    }
                }
                assert_eq!(fixture.state_manager.staged_count(), 0);
                assert_eq!(fixture.log.open_transaction_count(), 0);
            });
        }

        #[test]
        fn role_sequences_follow_the_log(roles in role_sequence_strategy(6)) {
            runtime().block_on(async {
                let fixture = TestReplicator::builder().open().await;
                for role in &roles {
                    fixture.change_role(*role).await.unwrap();
                }
                let last = *roles.last().unwrap();
                assert_eq!(fixture.log.role(), last);
                assert_eq!(fixture.state_manager.role(), last);
                assert!(!fixture.is_faulted());
                assert!(fixture.partition.faults().is_empty());
            });
        }

        #[test]
        fn retried_commits_succeed(errors in prop::collection::vec(retriable_error_strategy(), 0..5)) {
            runtime().block_on(async {
                let fixture = TestReplicator::builder()
                    .with_write_failures(errors)
                    .open_primary()
                    .await;

                let lsn = fixture.commit_providers(&["orders"]).await.unwrap();
                assert!(lsn.is_valid());
                assert!(fixture.get("orders").is_ok());
            });
        }
    }
}
