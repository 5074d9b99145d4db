//! Lifecycle command implementation.

use crate::error::CliResult;
use serde::Serialize;
use txnrep_core::{CoreError, CoreResult, ReplicaRole, TransactionManager};
use txnrep_testkit::TestReplicator;

/// One lifecycle step.
#[derive(Debug, Serialize)]
pub struct Step {
    /// What was attempted.
    pub action: String,
    /// Error message, if the step failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Replicator role after the step.
    pub role: String,
}

/// Lifecycle walk summary.
#[derive(Debug, Serialize)]
pub struct LifecycleReport {
    /// Steps in order.
    pub steps: Vec<Step>,
    /// Faults reported to the partition.
    pub faults: Vec<String>,
    /// Log lifecycle calls in order.
    pub log_steps: Vec<String>,
    /// Whether the role-change fault latched.
    pub faulted: bool,
}

fn record<T>(
    steps: &mut Vec<Step>,
    fixture: &TestReplicator,
    action: impl Into<String>,
    result: CoreResult<T>,
) {
    steps.push(Step {
        action: action.into(),
        error: result.err().map(|e| e.to_string()),
        role: fixture.replicator.role().to_string(),
    });
}

/// Runs the lifecycle command.
pub async fn run(fail_at: Option<ReplicaRole>, json: bool) -> CliResult<()> {
    let fixture = TestReplicator::new();
    if let Some(role) = fail_at {
        fixture
            .state_manager
            .fail_role_change(role, CoreError::unexpected("injected state manager failure"));
    }

    let mut steps = Vec::new();
    let opened = fixture.replicator.open().await;
    let open_failed = opened.is_err();
    record(&mut steps, &fixture, "open", opened);

    if !open_failed {
        for role in [ReplicaRole::Primary, ReplicaRole::ActiveSecondary, ReplicaRole::None] {
            let changed = fixture.replicator.change_role(role).await;
            let became_primary = changed.is_ok() && role == ReplicaRole::Primary;
            record(&mut steps, &fixture, format!("change-role {role}"), changed);

            if became_primary {
                let committed = fixture.commit_providers(&["lifecycle"]).await;
                let action = match &committed {
                    Ok(lsn) => format!("commit provider at {lsn}"),
                    Err(_) => "commit provider".to_string(),
                };
                record(&mut steps, &fixture, action, committed);
            }
        }
        let closed = fixture.replicator.close().await;
        record(&mut steps, &fixture, "close", closed);
    }

    let report = LifecycleReport {
        steps,
        faults: fixture
            .partition
            .faults()
            .iter()
            .map(|f| format!("{f:?}"))
            .collect(),
        log_steps: fixture
            .log
            .steps()
            .iter()
            .map(|s| format!("{s:?}"))
            .collect(),
        faulted: fixture.replicator.is_faulted(),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for step in &report.steps {
        match &step.error {
            None => println!("{:<32} ok      role={}", step.action, step.role),
            Some(error) => println!("{:<32} FAILED  role={}  {}", step.action, step.role, error),
        }
    }
    println!("Log calls: {}", report.log_steps.join(" -> "));
    if report.faulted {
        println!("Role change fault latched; faults reported: {}", report.faults.join(", "));
    }
    Ok(())
}
