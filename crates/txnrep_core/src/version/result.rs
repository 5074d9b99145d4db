//! Outcome types of the version-removal protocol.

use crate::completion::CompletionTask;
use crate::error::CoreResult;
use crate::types::Lsn;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Reader-drain signal for one visibility sequence number.
///
/// The notification completes once, when the last reader registered at
/// `visibility_sequence_number` unregisters. Clones observe the same
/// notification, so repeated removal attempts may all wait on it.
#[derive(Debug, Clone)]
pub struct EnumerationCompletionResult {
    visibility_sequence_number: Lsn,
    notification: Arc<CompletionTask>,
}

impl EnumerationCompletionResult {
    pub(crate) fn new(visibility_sequence_number: Lsn) -> Self {
        Self {
            visibility_sequence_number,
            notification: Arc::new(CompletionTask::new()),
        }
    }

    /// The visibility sequence number whose readers are being drained.
    pub fn visibility_sequence_number(&self) -> Lsn {
        self.visibility_sequence_number
    }

    /// Returns true once every reader of this version has unregistered.
    pub fn is_completed(&self) -> bool {
        self.notification.is_completed()
    }

    /// Waits until every reader of this version has unregistered.
    pub async fn wait(&self) -> CoreResult<()> {
        self.notification.await_completion().await
    }

    pub(crate) fn complete(&self) {
        self.notification.complete_awaiters(Ok(()));
    }
}

/// Result of a non-blocking removability check.
#[derive(Debug, Clone)]
pub struct TryRemoveVersionResult {
    can_be_removed: bool,
    enumeration_set: BTreeSet<Lsn>,
    notifications: Vec<EnumerationCompletionResult>,
}

impl TryRemoveVersionResult {
    /// The version can be removed now.
    pub fn removable() -> Self {
        Self {
            can_be_removed: true,
            enumeration_set: BTreeSet::new(),
            notifications: Vec::new(),
        }
    }

    /// The version is still in use by the readers in `enumeration_set`.
    ///
    /// # Panics
    ///
    /// Panics if either collection is empty.
    pub fn blocked(
        enumeration_set: BTreeSet<Lsn>,
        notifications: Vec<EnumerationCompletionResult>,
    ) -> Self {
        assert!(
            !enumeration_set.is_empty() && !notifications.is_empty(),
            "a blocked removal must name the readers it waits for"
        );
        Self {
            can_be_removed: false,
            enumeration_set,
            notifications,
        }
    }

    /// Returns true if the version can be removed now.
    pub fn can_be_removed(&self) -> bool {
        self.can_be_removed
    }

    /// Visibility sequence numbers still in use.
    pub fn enumeration_set(&self) -> &BTreeSet<Lsn> {
        &self.enumeration_set
    }

    /// Notifications to await before retrying the removal.
    pub fn enumeration_completion_notifications(&self) -> &[EnumerationCompletionResult] {
        &self.notifications
    }

    /// Waits for every pending reader named by this result.
    pub async fn wait_for_readers(&self) -> CoreResult<()> {
        for notification in &self.notifications {
            notification.wait().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removable_has_no_pending_readers() {
        let result = TryRemoveVersionResult::removable();
        assert!(result.can_be_removed());
        assert!(result.enumeration_set().is_empty());
        assert!(result.enumeration_completion_notifications().is_empty());
    }

    #[test]
    #[should_panic(expected = "must name the readers")]
    fn blocked_requires_readers() {
        TryRemoveVersionResult::blocked(BTreeSet::new(), Vec::new());
    }

    #[tokio::test]
    async fn clones_share_one_notification() {
        let first = EnumerationCompletionResult::new(Lsn::new(7));
        let second = first.clone();

        first.complete();
        assert!(second.is_completed());
        assert_eq!(second.wait().await, Ok(()));
        assert_eq!(second.visibility_sequence_number(), Lsn::new(7));
    }
}
