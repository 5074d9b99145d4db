//! Feed of committed transactions.
//!
//! The replicator emits one event per committed transaction or atomic
//! operation once its commit record is logged. Polling returns events in
//! commit LSN order.
//!
//! # Usage
//!
//! ```rust,ignore
//! let receiver = replicator.subscribe();
//! let lsn = txn.commit().await?;
//! let event = receiver.recv()?;
//! assert_eq!(event.commit_lsn, lsn);
//! ```

use crate::types::{Lsn, TransactionId};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};

const DEFAULT_HISTORY: usize = 10_000;

/// Which kind of handle committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitKind {
    /// A read/write transaction.
    Transaction,
    /// An atomic operation.
    AtomicOperation,
    /// A redo-only atomic operation.
    AtomicRedoOperation,
}

/// A committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionChangeEvent {
    /// Id of the committed handle.
    pub transaction_id: TransactionId,
    /// LSN of the commit record.
    pub commit_lsn: Lsn,
    /// Kind of handle.
    pub kind: CommitKind,
    /// Number of operations the transaction logged.
    pub operation_count: usize,
}

/// Publishes commit events to subscribers and keeps the most recent ones
/// for cursor polling.
///
/// History is ordered by commit LSN whatever order events arrive in, so a
/// consumer that pages with the last LSN it saw as cursor never skips an
/// event that is already in the history.
pub struct TransactionChangeFeed {
    subscribers: Mutex<Vec<Sender<TransactionChangeEvent>>>,
    history: RwLock<VecDeque<TransactionChangeEvent>>,
    capacity: usize,
}

impl TransactionChangeFeed {
    /// Creates a feed keeping the default number of events.
    pub fn new() -> Self {
        Self::with_max_history(DEFAULT_HISTORY)
    }

    /// Creates a feed keeping at most `capacity` events.
    pub fn with_max_history(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            history: RwLock::new(VecDeque::with_capacity(capacity.min(DEFAULT_HISTORY))),
            capacity,
        }
    }

    /// Subscribes to events published from now on.
    pub fn subscribe(&self) -> Receiver<TransactionChangeEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Records `event` in LSN order and sends it to every live subscriber.
    ///
    /// Subscribers receive events in publish order.
    pub fn emit(&self, event: TransactionChangeEvent) {
        {
            let mut history = self.history.write();
            let at = history.partition_point(|e| e.commit_lsn <= event.commit_lsn);
            history.insert(at, event.clone());
            while history.len() > self.capacity {
                history.pop_front();
            }
        }
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Up to `limit` events with a commit LSN above `cursor`, oldest first.
    pub fn poll(&self, cursor: Lsn, limit: usize) -> Vec<TransactionChangeEvent> {
        let history = self.history.read();
        let from = history.partition_point(|e| e.commit_lsn <= cursor);
        history.range(from..).take(limit).cloned().collect()
    }

    /// Highest commit LSN kept, `Lsn::INVALID` if none.
    pub fn latest_lsn(&self) -> Lsn {
        self.history
            .read()
            .back()
            .map_or(Lsn::INVALID, |e| e.commit_lsn)
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Number of events kept.
    pub fn history_len(&self) -> usize {
        self.history.read().len()
    }
}

impl Default for TransactionChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn event(lsn: i64) -> TransactionChangeEvent {
        TransactionChangeEvent {
            transaction_id: TransactionId::new(lsn * 10),
            commit_lsn: Lsn::new(lsn),
            kind: CommitKind::Transaction,
            operation_count: 1,
        }
    }

    #[test]
    fn emit_and_receive() {
        let feed = TransactionChangeFeed::new();
        let rx = feed.subscribe();

        feed.emit(event(1));

        let received = rx.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(received, event(1));
    }

    #[test]
    fn subscriber_cleanup() {
        let feed = TransactionChangeFeed::new();
        let rx = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 1);

        drop(rx);
        feed.emit(event(1));
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[test]
    fn poll_from_cursor() {
        let feed = TransactionChangeFeed::new();
        for lsn in 1..=5 {
            feed.emit(event(lsn));
        }

        let events = feed.poll(Lsn::new(2), 10);
        let lsns: Vec<i64> = events.iter().map(|e| e.commit_lsn.as_i64()).collect();
        assert_eq!(lsns, vec![3, 4, 5]);
        assert_eq!(feed.poll(Lsn::ZERO, 2).len(), 2);
    }

    #[test]
    fn late_events_are_kept_in_lsn_order() {
        let feed = TransactionChangeFeed::new();
        for lsn in [1, 3, 2, 5, 4] {
            feed.emit(event(lsn));
        }

        let lsns: Vec<i64> = feed
            .poll(Lsn::ZERO, 10)
            .iter()
            .map(|e| e.commit_lsn.as_i64())
            .collect();
        assert_eq!(lsns, vec![1, 2, 3, 4, 5]);
        assert_eq!(feed.latest_lsn(), Lsn::new(5));
    }

    #[test]
    fn paging_sees_every_event() {
        let feed = TransactionChangeFeed::new();
        for lsn in (1..=50).rev() {
            feed.emit(event(lsn));
        }

        let mut cursor = Lsn::ZERO;
        let mut seen = 0;
        loop {
            let page = feed.poll(cursor, 7);
            let Some(last) = page.last() else { break };
            cursor = last.commit_lsn;
            seen += page.len();
        }
        assert_eq!(seen, 50);
    }

    #[test]
    fn history_truncation() {
        let feed = TransactionChangeFeed::with_max_history(3);
        for lsn in 1..=10 {
            feed.emit(event(lsn));
        }

        assert_eq!(feed.history_len(), 3);
        assert_eq!(feed.poll(Lsn::INVALID, 100)[0].commit_lsn, Lsn::new(8));
        assert_eq!(feed.latest_lsn(), Lsn::new(10));
    }
}
