//! Reader registration and safe version removal.

use super::result::{EnumerationCompletionResult, TryRemoveVersionResult};
use crate::error::CoreResult;
use crate::types::{Lsn, StateProviderId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, trace};

#[derive(Default)]
struct VersionState {
    /// Registered visibility sequence numbers and their reader counts.
    readers: BTreeMap<Lsn, usize>,
    /// Drain notifications handed out to removal attempts, keyed by VSN.
    pending: HashMap<Lsn, EnumerationCompletionResult>,
}

/// Tracks which versions active readers depend on.
///
/// Readers call [`register`](Self::register) to pin a visibility sequence
/// number and [`unregister`](Self::unregister) when done. Truncation and
/// checkpoint cleanup call [`try_remove_version`](Self::try_remove_version),
/// which never blocks: it either reports the version removable or returns
/// the readers to wait for.
#[derive(Default)]
pub struct VersionManager {
    state: Mutex<VersionState>,
}

impl VersionManager {
    /// Creates an empty version manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a reader at `vsn` and returns it.
    pub fn register(&self, vsn: Lsn) -> Lsn {
        let mut state = self.state.lock();
        *state.readers.entry(vsn).or_insert(0) += 1;
        trace!(%vsn, "registered reader");
        vsn
    }

    /// Unregisters one reader at `vsn`.
    ///
    /// When the last reader of `vsn` leaves, any drain notification handed
    /// out for it is completed.
    ///
    /// # Panics
    ///
    /// Panics if `vsn` is not registered.
    pub fn unregister(&self, vsn: Lsn) {
        let drained = {
            let mut state = self.state.lock();
            let Some(count) = state.readers.get_mut(&vsn) else {
                panic!("unregister of unknown visibility sequence number {vsn}");
            };
            *count -= 1;
            if *count > 0 {
                return;
            }
            state.readers.remove(&vsn);
            state.pending.remove(&vsn)
        };

        trace!(%vsn, "last reader unregistered");
        if let Some(notification) = drained {
            notification.complete();
        }
    }

    /// Returns true if at least one reader is registered at `vsn`.
    pub fn is_registered(&self, vsn: Lsn) -> bool {
        self.state.lock().readers.contains_key(&vsn)
    }

    /// Number of distinct registered visibility sequence numbers.
    pub fn registered_count(&self) -> usize {
        self.state.lock().readers.len()
    }

    /// Checks whether the version committed at `commit_lsn` and superseded at
    /// `next_commit_lsn` can be removed.
    ///
    /// Readers with a VSN in `[commit_lsn, next_commit_lsn)` can still see
    /// the version and block its removal.
    pub fn try_remove_version(
        &self,
        state_provider_id: StateProviderId,
        commit_lsn: Lsn,
        next_commit_lsn: Lsn,
    ) -> TryRemoveVersionResult {
        let mut state = self.state.lock();
        let blocking: BTreeSet<Lsn> = state
            .readers
            .range(commit_lsn..next_commit_lsn)
            .map(|(vsn, _)| *vsn)
            .collect();

        if blocking.is_empty() {
            return TryRemoveVersionResult::removable();
        }

        let notifications = blocking
            .iter()
            .map(|vsn| {
                state
                    .pending
                    .entry(*vsn)
                    .or_insert_with(|| EnumerationCompletionResult::new(*vsn))
                    .clone()
            })
            .collect();

        debug!(
            sp = %state_provider_id,
            %commit_lsn,
            %next_commit_lsn,
            readers = blocking.len(),
            "version removal blocked by readers"
        );
        TryRemoveVersionResult::blocked(blocking, notifications)
    }

    /// Waits until the checkpoint at `checkpoint_lsn_to_be_removed` is no
    /// longer visible to any reader.
    pub async fn try_remove_checkpoint(
        &self,
        checkpoint_lsn_to_be_removed: Lsn,
        next_checkpoint_lsn: Lsn,
    ) -> CoreResult<()> {
        loop {
            let result = self.try_remove_version(
                StateProviderId::STATE_MANAGER,
                checkpoint_lsn_to_be_removed,
                next_checkpoint_lsn,
            );
            if result.can_be_removed() {
                return Ok(());
            }
            result.wait_for_readers().await?;
        }
    }
}
