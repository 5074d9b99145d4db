//! Simulate command implementation.

use crate::error::{CliError, CliResult};
use serde::Serialize;
use tracing::info;
use txnrep_core::{CoreError, Lsn, ReplicaRole};
use txnrep_testkit::{stress_concurrent_commits, StressConfig, StressTestResult, TestReplicator};

/// Options of the simulate command.
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    /// Transactions to commit.
    pub transactions: usize,
    /// Concurrent tasks.
    pub tasks: usize,
    /// Operations per transaction.
    pub operations: usize,
    /// Retriable log failures to inject.
    pub failures: usize,
}

/// Simulation summary.
#[derive(Debug, Serialize)]
pub struct SimulateReport {
    /// Transaction outcomes.
    pub result: StressTestResult,
    /// Retriable failures injected.
    pub injected_failures: usize,
    /// Commit events seen on the change feed.
    pub commit_events: usize,
    /// Last committed LSN.
    pub last_committed_lsn: i64,
    /// State providers registered at the end.
    pub state_providers: usize,
}

fn injected_failure(i: usize) -> CoreError {
    match i % 4 {
        0 => CoreError::NoWriteQuorum,
        1 => CoreError::ReconfigurationPending,
        2 => CoreError::ReplicationQueueFull,
        _ => CoreError::ServiceTooBusy,
    }
}

/// Runs the simulate command.
pub async fn run(options: &SimulateOptions, json: bool) -> CliResult<()> {
    if options.tasks == 0 {
        return Err(CliError::InvalidArgument("tasks must be positive".into()));
    }

    let fixture = TestReplicator::builder()
        .with_write_failures((0..options.failures).map(injected_failure))
        .build();
    fixture.replicator.open().await?;
    fixture.replicator.change_role(ReplicaRole::Primary).await?;
    info!(
        transactions = options.transactions,
        tasks = options.tasks,
        "starting simulation"
    );

    let config = StressConfig {
        transactions: options.transactions,
        tasks: options.tasks,
        operations_per_transaction: options.operations,
    };
    let result = stress_concurrent_commits(&fixture.replicator, &config).await;

    let report = SimulateReport {
        injected_failures: options.failures,
        commit_events: fixture.replicator.poll_changes(Lsn::INVALID, usize::MAX).len(),
        last_committed_lsn: fixture.replicator.get_info()?.last_committed_lsn.as_i64(),
        state_providers: fixture.replicator.create_enumerator()?.len(),
        result,
    };
    fixture.replicator.close().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        report.result.print_summary("simulate");
        println!("Injected failures: {}", report.injected_failures);
        println!("Commit events: {}", report.commit_events);
        println!("Last committed LSN: {}", report.last_committed_lsn);
        println!("State providers: {}", report.state_providers);
    }
    Ok(())
}
