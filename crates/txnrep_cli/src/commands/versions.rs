//! Versions command implementation.

use crate::error::{CliError, CliResult};
use serde::Serialize;
use txnrep_core::{Lsn, ReplicaRole, StateProviderId};
use txnrep_testkit::TestReplicator;

/// State of version removal after one reader is released.
#[derive(Debug, Serialize)]
pub struct Release {
    /// Visibility sequence number of the released reader.
    pub released: i64,
    /// Readers still blocking removal.
    pub blocking: Vec<i64>,
    /// Whether the version can now be removed.
    pub removable: bool,
}

/// Version removal walkthrough.
#[derive(Debug, Serialize)]
pub struct VersionsReport {
    /// First LSN at which the version is visible.
    pub commit_lsn: i64,
    /// LSN at which the version is superseded.
    pub next_commit_lsn: i64,
    /// Readers registered, by visibility sequence number.
    pub readers: Vec<i64>,
    /// Readers blocking removal before any is released.
    pub initially_blocking: Vec<i64>,
    /// Removal state after each release.
    pub releases: Vec<Release>,
}

fn lsns<'a>(set: impl IntoIterator<Item = &'a Lsn>) -> Vec<i64> {
    set.into_iter().map(|lsn| lsn.as_i64()).collect()
}

/// Runs the versions command.
pub async fn run(reader_count: usize, json: bool) -> CliResult<()> {
    if reader_count == 0 {
        return Err(CliError::InvalidArgument("at least one reader is required".into()));
    }

    let fixture = TestReplicator::new();
    fixture.replicator.open().await?;
    fixture.replicator.change_role(ReplicaRole::Primary).await?;

    let mut readers = Vec::with_capacity(reader_count);
    for i in 0..reader_count {
        let reader = fixture.replicator.create_transaction()?;
        let vsn = reader.get_visibility_sequence_number().await?;
        readers.push((reader, vsn));
        let name = format!("version-{i}");
        fixture.commit_providers(&[name.as_str()]).await?;
    }

    let commit_lsn = readers.first().map(|(_, vsn)| *vsn).unwrap_or(Lsn::ZERO);
    let next_commit_lsn = fixture.replicator.get_info()?.last_committed_lsn;
    let sp = StateProviderId::STATE_MANAGER;

    let initial = fixture
        .replicator
        .try_remove_version(sp, commit_lsn, next_commit_lsn)?;
    let mut report = VersionsReport {
        commit_lsn: commit_lsn.as_i64(),
        next_commit_lsn: next_commit_lsn.as_i64(),
        readers: readers.iter().map(|(_, vsn)| vsn.as_i64()).collect(),
        initially_blocking: lsns(initial.enumeration_set()),
        releases: Vec::with_capacity(reader_count),
    };

    for (reader, vsn) in readers {
        reader.dispose().await;
        let removal = fixture
            .replicator
            .try_remove_version(sp, commit_lsn, next_commit_lsn)?;
        report.releases.push(Release {
            released: vsn.as_i64(),
            blocking: lsns(removal.enumeration_set()),
            removable: removal.can_be_removed(),
        });
    }

    initial.wait_for_readers().await?;
    fixture
        .replicator
        .try_remove_checkpoint(commit_lsn, next_commit_lsn)
        .await?;
    fixture.replicator.close().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "Version visible from {} until {}",
        report.commit_lsn, report.next_commit_lsn
    );
    println!("Readers: {:?}", report.readers);
    println!("Blocked by: {:?}", report.initially_blocking);
    for release in &report.releases {
        if release.removable {
            println!("released {:>4} -> removable", release.released);
        } else {
            println!("released {:>4} -> blocked by {:?}", release.released, release.blocking);
        }
    }
    Ok(())
}
