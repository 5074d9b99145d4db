//! Transaction state machine.

use crate::error::{CoreError, CoreResult};
use crate::types::TransactionId;
use parking_lot::Mutex;
use tracing::trace;

/// Phase of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// Operations may be added; commit or abort may start.
    Active,
    /// A visibility sequence number is being acquired.
    Reading,
    /// Commit is in flight.
    Committing,
    /// Abort is in flight.
    Aborting,
    /// Committed. Terminal.
    Committed,
    /// Aborted. Terminal.
    Aborted,
    /// Commit or abort failed fatally. Terminal.
    Faulted,
}

impl TransactionState {
    /// Returns true for `Committed`, `Aborted` and `Faulted`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionState::Committed | TransactionState::Aborted | TransactionState::Faulted
        )
    }
}

/// Why an abort was initiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AbortReason {
    /// No abort has started.
    #[default]
    Invalid,
    /// The caller asked for the abort.
    UserAborted,
    /// The handle was disposed while still active.
    UserDisposed,
    /// The replicator aborted the transaction, for example on losing primary.
    SystemAborted,
}

#[derive(Debug)]
struct Machine {
    state: TransactionState,
    abort_reason: AbortReason,
}

/// Guards the legal state transitions of one transaction.
///
/// Every transition takes the single lock, validates, mutates and releases.
/// The lock is never held across an await. Transitions that start work
/// (`on_begin_*`, `on_add_operation`) return a rejection when the
/// transaction is not `Active`; transitions that finish work assert that the
/// matching start happened.
#[derive(Debug)]
pub struct TransactionStateMachine {
    id: TransactionId,
    machine: Mutex<Machine>,
}

impl TransactionStateMachine {
    /// Creates a state machine in `Active`.
    pub fn new(id: TransactionId) -> Self {
        Self {
            id,
            machine: Mutex::new(Machine {
                state: TransactionState::Active,
                abort_reason: AbortReason::Invalid,
            }),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> TransactionState {
        self.machine.lock().state
    }

    /// Returns the abort reason, `Invalid` if no abort has started.
    pub fn abort_reason(&self) -> AbortReason {
        self.machine.lock().abort_reason
    }

    /// Runs `record` while holding the lock, if the transaction is active.
    ///
    /// The check and the recording are atomic with respect to a concurrent
    /// abort.
    pub fn on_add_operation<R>(&self, record: impl FnOnce() -> CoreResult<R>) -> CoreResult<R> {
        let machine = self.machine.lock();
        if machine.state != TransactionState::Active {
            return Err(rejection(&machine));
        }
        record()
    }

    /// `Active -> Reading`.
    pub fn on_begin_read(&self) -> CoreResult<()> {
        self.begin(TransactionState::Reading, None)
    }

    /// `Reading -> Active`.
    pub fn on_end_read(&self) {
        self.finish(TransactionState::Reading, TransactionState::Active);
    }

    /// `Active -> Committing`.
    pub fn on_begin_commit(&self) -> CoreResult<()> {
        self.begin(TransactionState::Committing, None)
    }

    /// `Committing -> Committed`.
    pub fn on_commit_successful(&self) {
        self.finish(TransactionState::Committing, TransactionState::Committed);
    }

    /// `Committing -> Faulted`.
    pub fn on_commit_faulted(&self) {
        self.finish(TransactionState::Committing, TransactionState::Faulted);
    }

    /// `Committing -> Active` after a commit timed out or was cancelled.
    pub fn on_commit_cancelled(&self) {
        self.finish(TransactionState::Committing, TransactionState::Active);
    }

    /// `Committing -> Active` after a retriable atomic-operation failure.
    pub fn on_atomic_operation_retry(&self) {
        self.finish(TransactionState::Committing, TransactionState::Active);
    }

    /// `Active -> Aborting`, recording `reason`.
    ///
    /// # Panics
    ///
    /// Panics if `reason` is [`AbortReason::Invalid`].
    pub fn on_begin_abort(&self, reason: AbortReason) -> CoreResult<()> {
        assert_ne!(reason, AbortReason::Invalid, "abort requires a reason");
        self.begin(TransactionState::Aborting, Some(reason))
    }

    /// Runs `unregister` under the lock, then `Active -> Aborting` with
    /// reason `UserDisposed`.
    ///
    /// A competing abort either happens first (and dispose is rejected
    /// without running `unregister`) or observes `Aborting`.
    pub fn on_user_dispose_begin_abort(&self, unregister: impl FnOnce()) -> CoreResult<()> {
        let mut machine = self.machine.lock();
        if machine.state != TransactionState::Active {
            return Err(rejection(&machine));
        }
        unregister();
        machine.state = TransactionState::Aborting;
        machine.abort_reason = AbortReason::UserDisposed;
        trace!(txn = %self.id, "active -> aborting (disposed)");
        Ok(())
    }

    /// `Aborting -> Aborted`.
    pub fn on_abort_successful(&self) {
        self.finish(TransactionState::Aborting, TransactionState::Aborted);
    }

    /// `Aborting -> Faulted`.
    pub fn on_abort_faulted(&self) {
        self.finish(TransactionState::Aborting, TransactionState::Faulted);
    }

    fn begin(&self, to: TransactionState, reason: Option<AbortReason>) -> CoreResult<()> {
        let mut machine = self.machine.lock();
        if machine.state != TransactionState::Active {
            return Err(rejection(&machine));
        }
        machine.state = to;
        if let Some(reason) = reason {
            machine.abort_reason = reason;
        }
        trace!(txn = %self.id, ?to, "active -> {:?}", to);
        Ok(())
    }

    fn finish(&self, from: TransactionState, to: TransactionState) {
        let mut machine = self.machine.lock();
        assert_eq!(
            machine.state, from,
            "{} cannot move to {:?} from {:?}",
            self.id, to, machine.state
        );
        machine.state = to;
        trace!(txn = %self.id, ?from, ?to, "transition");
    }

    #[cfg(test)]
    pub(crate) fn with_state(id: TransactionId, state: TransactionState, reason: AbortReason) -> Self {
        Self {
            id,
            machine: Mutex::new(Machine {
                state,
                abort_reason: reason,
            }),
        }
    }
}

/// Maps a non-active state to the error returned to the caller.
fn rejection(machine: &Machine) -> CoreError {
    match machine.state {
        TransactionState::Reading => CoreError::ConcurrentTransactionUse,
        TransactionState::Committing | TransactionState::Committed => {
            CoreError::TransactionNotActive
        }
        TransactionState::Aborting | TransactionState::Aborted | TransactionState::Faulted => {
            match machine.abort_reason {
                AbortReason::SystemAborted => CoreError::TransactionAbortedBySystem,
                AbortReason::Invalid | AbortReason::UserAborted | AbortReason::UserDisposed => {
                    CoreError::TransactionNotActive
                }
            }
        }
        TransactionState::Active => unreachable!("an active transaction is never rejected"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn machine() -> TransactionStateMachine {
        TransactionStateMachine::new(TransactionId::new(1))
    }

    #[derive(Debug, Clone, Copy)]
    enum Event {
        AddOperation,
        BeginRead,
        BeginCommit,
        BeginAbort(AbortReason),
        UserDispose,
    }

    fn apply(machine: &TransactionStateMachine, event: Event) -> CoreResult<()> {
        match event {
            Event::AddOperation => machine.on_add_operation(|| Ok(())),
            Event::BeginRead => machine.on_begin_read(),
            Event::BeginCommit => machine.on_begin_commit(),
            Event::BeginAbort(reason) => machine.on_begin_abort(reason),
            Event::UserDispose => machine.on_user_dispose_begin_abort(|| {}),
        }
    }

    fn non_active_state() -> impl Strategy<Value = TransactionState> {
        prop_oneof![
            Just(TransactionState::Reading),
            Just(TransactionState::Committing),
            Just(TransactionState::Aborting),
            Just(TransactionState::Committed),
            Just(TransactionState::Aborted),
            Just(TransactionState::Faulted),
        ]
    }

    fn abort_reason() -> impl Strategy<Value = AbortReason> {
        prop_oneof![
            Just(AbortReason::Invalid),
            Just(AbortReason::UserAborted),
            Just(AbortReason::UserDisposed),
            Just(AbortReason::SystemAborted),
        ]
    }

    fn event() -> impl Strategy<Value = Event> {
        prop_oneof![
            Just(Event::AddOperation),
            Just(Event::BeginRead),
            Just(Event::BeginCommit),
            Just(Event::BeginAbort(AbortReason::UserAborted)),
            Just(Event::BeginAbort(AbortReason::SystemAborted)),
            Just(Event::UserDispose),
        ]
    }

    fn expected_rejection(state: TransactionState, reason: AbortReason) -> CoreError {
        match (state, reason) {
            (TransactionState::Reading, _) => CoreError::ConcurrentTransactionUse,
            (
                TransactionState::Aborting | TransactionState::Aborted | TransactionState::Faulted,
                AbortReason::SystemAborted,
            ) => CoreError::TransactionAbortedBySystem,
            _ => CoreError::TransactionNotActive,
        }
    }

    proptest! {
        #[test]
        fn illegal_events_leave_state_unchanged(
            state in non_active_state(),
            reason in abort_reason(),
            event in event(),
        ) {
            let machine = TransactionStateMachine::with_state(TransactionId::new(9), state, reason);

            let result = apply(&machine, event);

            prop_assert_eq!(result, Err(expected_rejection(state, reason)));
            prop_assert_eq!(machine.state(), state);
            prop_assert_eq!(machine.abort_reason(), reason);
        }
    }

    #[test]
    fn commit_path() {
        let m = machine();
        m.on_begin_commit().unwrap();
        assert_eq!(m.state(), TransactionState::Committing);
        m.on_commit_successful();
        assert_eq!(m.state(), TransactionState::Committed);
        assert!(m.state().is_terminal());
    }

    #[test]
    fn cancelled_commit_returns_to_active() {
        let m = machine();
        m.on_begin_commit().unwrap();
        m.on_commit_cancelled();
        assert_eq!(m.state(), TransactionState::Active);
        m.on_begin_commit().unwrap();
    }

    #[test]
    fn atomic_operation_retry_returns_to_active() {
        let m = machine();
        m.on_begin_commit().unwrap();
        m.on_atomic_operation_retry();
        assert_eq!(m.state(), TransactionState::Active);
    }

    #[test]
    fn reading_round_trip() {
        let m = machine();
        m.on_begin_read().unwrap();
        assert_eq!(m.on_add_operation(|| Ok(())), Err(CoreError::ConcurrentTransactionUse));
        m.on_end_read();
        assert_eq!(m.state(), TransactionState::Active);
    }

    #[test]
    fn abort_records_reason() {
        let m = machine();
        m.on_begin_abort(AbortReason::SystemAborted).unwrap();
        assert_eq!(m.abort_reason(), AbortReason::SystemAborted);
        m.on_abort_successful();
        assert_eq!(m.state(), TransactionState::Aborted);
        assert_eq!(
            m.on_begin_commit(),
            Err(CoreError::TransactionAbortedBySystem)
        );
    }

    #[test]
    fn abort_faulted_is_terminal() {
        let m = machine();
        m.on_begin_abort(AbortReason::UserAborted).unwrap();
        m.on_abort_faulted();
        assert_eq!(m.state(), TransactionState::Faulted);
        assert_eq!(m.on_begin_read(), Err(CoreError::TransactionNotActive));
    }

    #[test]
    fn add_operation_runs_inside_lock() {
        let m = machine();
        let recorded = m.on_add_operation(|| Ok(42)).unwrap();
        assert_eq!(recorded, 42);

        m.on_begin_abort(AbortReason::UserAborted).unwrap();
        let mut ran = false;
        let result = m.on_add_operation(|| {
            ran = true;
            Ok(())
        });
        assert_eq!(result, Err(CoreError::TransactionNotActive));
        assert!(!ran);
    }

    #[test]
    fn dispose_runs_unregister_only_when_active() {
        let m = machine();
        let mut calls = 0;
        m.on_user_dispose_begin_abort(|| calls += 1).unwrap();
        assert_eq!(m.abort_reason(), AbortReason::UserDisposed);
        assert_eq!(m.state(), TransactionState::Aborting);

        assert!(m.on_user_dispose_begin_abort(|| calls += 1).is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    #[should_panic(expected = "cannot move to Committed")]
    fn finishing_without_starting_panics() {
        machine().on_commit_successful();
    }

    #[test]
    #[should_panic(expected = "abort requires a reason")]
    fn abort_without_reason_panics() {
        let _ = machine().on_begin_abort(AbortReason::Invalid);
    }
}
