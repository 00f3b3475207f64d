use std::{
    collections::{HashSet, VecDeque},
    convert::TryInto,
    time::{Duration, Instant},
};

/// Number of bytes of a transaction id on the wire.
pub(crate) const TRANSACTION_ID_LEN: usize = 2;

/// Identifies one outgoing query. Echoed back by the remote in the `t` key.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Debug)]
pub(crate) struct TransactionID(u16);

impl TransactionID {
    /// Interpret bytes received from the wire. Ids we did not generate have the wrong length.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; TRANSACTION_ID_LEN] = bytes.try_into().ok()?;
        Some(Self(u16::from_be_bytes(bytes)))
    }

    pub fn as_bytes(&self) -> [u8; TRANSACTION_ID_LEN] {
        self.0.to_be_bytes()
    }
}

/// Hands out transaction ids from a wrapping counter. An id is not handed out again while it
/// is in flight nor for a grace period after it was released, so a late response can never be
/// matched to a newer transaction.
pub(crate) struct TransactionIdGenerator {
    next: u16,
    in_flight: HashSet<TransactionID>,
    retired: VecDeque<(TransactionID, Instant)>,
    retired_set: HashSet<TransactionID>,
    grace: Duration,
}

impl TransactionIdGenerator {
    pub fn new(grace: Duration) -> Self {
        Self::with_start(rand::random(), grace)
    }

    fn with_start(next: u16, grace: Duration) -> Self {
        Self {
            next,
            in_flight: HashSet::new(),
            retired: VecDeque::new(),
            retired_set: HashSet::new(),
            grace,
        }
    }

    /// Returns `None` when every id is either in flight or retired.
    pub fn generate(&mut self, now: Instant) -> Option<TransactionID> {
        self.purge_retired(now);

        for _ in 0..=u16::MAX {
            let tid = TransactionID(self.next);
            self.next = self.next.wrapping_add(1);

            if !self.in_flight.contains(&tid) && !self.retired_set.contains(&tid) {
                self.in_flight.insert(tid);
                return Some(tid);
            }
        }

        None
    }

    /// The transaction terminated. Its id is retired for the grace period.
    pub fn release(&mut self, tid: TransactionID, now: Instant) {
        if self.in_flight.remove(&tid) {
            self.retired.push_back((tid, now));
            self.retired_set.insert(tid);
        }
    }

    #[cfg(test)]
    pub fn num_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn purge_retired(&mut self, now: Instant) {
        while let Some((tid, retired_at)) = self.retired.front().copied() {
            if now.saturating_duration_since(retired_at) < self.grace {
                break;
            }

            self.retired.pop_front();
            self.retired_set.remove(&tid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRACE: Duration = Duration::from_secs(30);

    #[test]
    fn positive_bytes_round_trip() {
        let tid = TransactionID(0xABCD);

        assert_eq!(tid.as_bytes(), [0xAB, 0xCD]);
        assert_eq!(TransactionID::from_bytes(&tid.as_bytes()), Some(tid));
    }

    #[test]
    fn negative_foreign_transaction_id() {
        assert_eq!(TransactionID::from_bytes(b"abc"), None);
        assert_eq!(TransactionID::from_bytes(b""), None);
    }

    #[test]
    fn positive_ids_unique_while_in_flight() {
        let now = Instant::now();
        let mut generator = TransactionIdGenerator::new(GRACE);
        let mut seen = HashSet::new();

        for _ in 0..1000 {
            assert!(seen.insert(generator.generate(now).unwrap()));
        }
        assert_eq!(generator.num_in_flight(), 1000);
    }

    #[test]
    fn positive_wrap_around_skips_in_flight() {
        let now = Instant::now();
        let mut generator = TransactionIdGenerator::with_start(u16::MAX, GRACE);

        let first = generator.generate(now).unwrap();
        let second = generator.generate(now).unwrap();
        assert_eq!(first, TransactionID(u16::MAX));
        assert_eq!(second, TransactionID(0));

        // Wrap all the way around: the two ids still in flight are skipped.
        for _ in 0..(u16::MAX as usize - 1) {
            generator.generate(now).unwrap();
        }
        assert_eq!(generator.generate(now), None);
    }

    #[test]
    fn negative_retired_id_not_reused_during_grace() {
        let now = Instant::now();
        let mut generator = TransactionIdGenerator::with_start(7, GRACE);

        let tid = generator.generate(now).unwrap();
        generator.release(tid, now);
        generator.next = 7;

        assert_ne!(generator.generate(now + GRACE / 2), Some(tid));
    }

    #[test]
    fn positive_retired_id_reused_after_grace() {
        let now = Instant::now();
        let mut generator = TransactionIdGenerator::with_start(7, GRACE);

        let tid = generator.generate(now).unwrap();
        generator.release(tid, now);
        generator.next = 7;

        assert_eq!(generator.generate(now + GRACE), Some(tid));
    }
}
