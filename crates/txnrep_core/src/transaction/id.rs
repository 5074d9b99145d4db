//! Process-wide transaction id generation.

use crate::types::TransactionId;
use parking_lot::{const_mutex, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

static GLOBAL: TransactionIdGenerator = TransactionIdGenerator::new();

/// Generates strictly increasing ids seeded from wall-clock time.
///
/// The process shares one generator, so ids are unique across every
/// replicator in the process, not per replica. Each id is
/// `max(now, last + 1)` where `now` counts 100ns ticks since the Unix
/// epoch, so ids keep increasing even when the clock stalls or steps back.
#[derive(Debug)]
pub struct TransactionIdGenerator {
    last: Mutex<i64>,
}

impl TransactionIdGenerator {
    /// Creates a generator that has not handed out any id.
    pub const fn new() -> Self {
        Self {
            last: const_mutex(0),
        }
    }

    /// The process-wide generator.
    pub fn global() -> &'static TransactionIdGenerator {
        &GLOBAL
    }

    /// Id for a read/write transaction (positive).
    pub fn next_transaction_id(&self) -> TransactionId {
        TransactionId::new(self.next_with_clock(clock_ticks()))
    }

    /// Id for an atomic operation (negative).
    pub fn next_atomic_operation_id(&self) -> TransactionId {
        TransactionId::new(-self.next_with_clock(clock_ticks()))
    }

    /// Advances the generator given the current clock reading.
    pub fn next_with_clock(&self, now: i64) -> i64 {
        let mut last = self.last.lock();
        let next = now.max(*last + 1);
        *last = next;
        next
    }
}

impl Default for TransactionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn clock_ticks() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_nanos() / 100).unwrap_or(i64::MAX / 2))
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn frozen_clock_still_increases() {
        let generator = TransactionIdGenerator::new();
        let mut previous = 0;
        for _ in 0..10_000 {
            let id = generator.next_with_clock(1_000);
            assert!(id > previous);
            previous = id;
        }
    }

    #[test]
    fn sign_encodes_kind() {
        let generator = TransactionIdGenerator::new();
        let txn = generator.next_transaction_id();
        let atomic = generator.next_atomic_operation_id();
        assert!(txn.as_i64() > 0);
        assert!(atomic.is_atomic_operation());
        assert!(-atomic.as_i64() > txn.as_i64());
    }

    #[test]
    fn global_ids_increase_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                std::thread::spawn(|| {
                    (0..500)
                        .map(|_| TransactionIdGenerator::global().next_transaction_id())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            let ids = handle.join().unwrap();
            assert!(ids.windows(2).all(|w| w[0] < w[1]));
            all.extend(ids);
        }
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), total);
    }

    proptest! {
        #[test]
        fn any_clock_sequence_is_strictly_increasing(clock in proptest::collection::vec(0i64..1_000_000, 1..200)) {
            let generator = TransactionIdGenerator::new();
            let ids: Vec<i64> = clock.iter().map(|now| generator.next_with_clock(*now)).collect();
            prop_assert!(ids.windows(2).all(|w| w[0] < w[1]));
        }
    }
}
