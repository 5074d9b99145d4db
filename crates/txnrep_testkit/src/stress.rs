//! Stress drivers for the replicator.
//!
//! These drivers run many concurrent transactions, readers and atomic
//! operations against one replicator and count the outcomes.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::warn;
use txnrep_core::{CoreError, OperationData, StateProviderId};
use txnrep_replicator::{LogReplicator, NamedStateProvider, StateManager, TransactionalReplicator};

/// Result of a stress test run.
#[derive(Debug, Clone, Serialize)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Renders the result as JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of transactions to run in total.
    pub transactions: usize,
    /// Number of concurrent tasks.
    pub tasks: usize,
    /// Providers registered per transaction.
    pub operations_per_transaction: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            transactions: 1_000,
            tasks: 4,
            operations_per_transaction: 2,
        }
    }
}

impl StressConfig {
    fn per_task(&self) -> usize {
        self.transactions / self.tasks.max(1)
    }
}

#[derive(Default)]
struct Tally {
    successful: AtomicUsize,
    failed: AtomicUsize,
}

impl Tally {
    fn record<T, E>(&self, result: &Result<T, E>) {
        let counter = if result.is_ok() {
            &self.successful
        } else {
            &self.failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Waits for every task. A task that panicked counts as one failure.
    async fn join(&self, handles: Vec<JoinHandle<()>>) {
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "stress task failed");
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn finish(&self, started: Instant) -> StressTestResult {
        StressTestResult::new(
            self.successful.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            started.elapsed(),
        )
    }
}

/// Registers distinct providers from concurrent transactions.
///
/// Every transaction adds `operations_per_transaction` providers and
/// commits; one committed transaction counts as one operation.
pub async fn stress_concurrent_commits<L, S>(
    replicator: &Arc<TransactionalReplicator<L, S>>,
    config: &StressConfig,
) -> StressTestResult
where
    L: LogReplicator + 'static,
    S: StateManager + 'static,
{
    let tally = Arc::new(Tally::default());
    let started = Instant::now();
    let mut handles = Vec::with_capacity(config.tasks);

    for task in 0..config.tasks {
        let replicator = Arc::clone(replicator);
        let tally = Arc::clone(&tally);
        let per_task = config.per_task();
        let operations = config.operations_per_transaction.max(1);

        handles.push(tokio::spawn(async move {
            for i in 0..per_task {
                let Ok(txn) = replicator.create_transaction() else {
                    tally.failed.fetch_add(1, Ordering::Relaxed);
                    continue;
                };
                let mut added = Ok(StateProviderId::STATE_MANAGER);
                for op in 0..operations {
                    added = replicator
                        .add(&txn, NamedStateProvider::new(format!("stress-{task}-{i}-{op}")))
                        .await;
                    if added.is_err() {
                        break;
                    }
                }
                let result = match added {
                    Ok(_) => txn.commit().await.map(|_| ()),
                    Err(e) => Err(e),
                };
                tally.record(&result);
                txn.dispose().await;
            }
        }));
    }

    tally.join(handles).await;
    tally.finish(started)
}

/// Registers and releases visibility sequence numbers from concurrent
/// readers while version removal is checked in between.
pub async fn stress_reader_churn<L, S>(
    replicator: &Arc<TransactionalReplicator<L, S>>,
    config: &StressConfig,
) -> StressTestResult
where
    L: LogReplicator + 'static,
    S: StateManager + 'static,
{
    let tally = Arc::new(Tally::default());
    let started = Instant::now();
    let mut handles = Vec::with_capacity(config.tasks);

    for _ in 0..config.tasks {
        let replicator = Arc::clone(replicator);
        let tally = Arc::clone(&tally);
        let per_task = config.per_task();

        handles.push(tokio::spawn(async move {
            for _ in 0..per_task {
                let Ok(reader) = replicator.create_transaction() else {
                    tally.failed.fetch_add(1, Ordering::Relaxed);
                    continue;
                };
                let result = match reader.get_visibility_sequence_number().await {
                    Ok(vsn) => replicator
                        .try_remove_version(StateProviderId::STATE_MANAGER, vsn, vsn.next())
                        .and_then(|removal| {
                            if removal.can_be_removed() {
                                Err(CoreError::unexpected("visible version reported removable"))
                            } else {
                                Ok(())
                            }
                        }),
                    Err(e) => Err(e),
                };
                tally.record(&result);
                reader.dispose().await;
            }
        }));
    }

    tally.join(handles).await;
    tally.finish(started)
}

/// Commits atomic operations with `operation` from concurrent tasks on
/// `state_provider_id`.
pub async fn stress_atomic_operations<L, S>(
    replicator: &Arc<TransactionalReplicator<L, S>>,
    state_provider_id: StateProviderId,
    operation: OperationData,
    config: &StressConfig,
) -> StressTestResult
where
    L: LogReplicator + 'static,
    S: StateManager + 'static,
{
    let tally = Arc::new(Tally::default());
    let started = Instant::now();
    let mut handles = Vec::with_capacity(config.tasks);

    for _ in 0..config.tasks {
        let replicator = Arc::clone(replicator);
        let tally = Arc::clone(&tally);
        let operation = operation.clone();
        let per_task = config.per_task();

        handles.push(tokio::spawn(async move {
            for _ in 0..per_task {
                let result = match replicator.create_atomic_operation() {
                    Ok(atomic) => {
                        atomic
                            .add_operation(state_provider_id, operation.clone(), None)
                            .await
                    }
                    Err(e) => Err(e),
                };
                tally.record(&result);
            }
        }));
    }

    tally.join(handles).await;
    tally.finish(started)
}
