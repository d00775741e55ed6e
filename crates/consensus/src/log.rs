//! The replica log: in-flight slots inside the watermark window plus the
//! committed suffix awaiting (or past) delivery.

use std::collections::BTreeMap;

use pbft_types::{ClientRequest, Hash, PreparedProof, SeqNum};

use crate::slot::Slot;

/// A committed slot: the agreed digest and, for non-null slots, the
/// request to deliver.
#[derive(Debug, Clone)]
pub struct CommittedEntry {
    /// The digest the quorum committed to.
    pub digest: Hash,
    /// The request itself; `None` for null slots.
    pub request: Option<ClientRequest>,
}

/// Ordered log state for one replica.
///
/// Sequence numbers live in the watermark window
/// `(stable, stable + window]`; anything outside is refused. Committed
/// entries are immutable once recorded and are only released by a
/// stable checkpoint.
#[derive(Debug)]
pub struct ReplicaLog {
    window: u64,
    /// Sequence of the latest stable checkpoint (0 at genesis).
    stable: SeqNum,
    /// In-flight vote accumulators.
    slots: BTreeMap<SeqNum, Slot>,
    /// Commit outcomes, retained until checkpointed away.
    committed: BTreeMap<SeqNum, CommittedEntry>,
    /// Next sequence number this replica would assign as primary.
    next_seq: SeqNum,
    /// Highest sequence delivered to the application, no gaps below.
    delivered: SeqNum,
}

impl ReplicaLog {
    /// Create an empty log with the given watermark window width.
    pub fn new(window: u64) -> Self {
        Self {
            window,
            stable: SeqNum::ZERO,
            slots: BTreeMap::new(),
            committed: BTreeMap::new(),
            next_seq: SeqNum(1),
            delivered: SeqNum::ZERO,
        }
    }

    /// Low watermark: the first assignable sequence (stable + 1).
    pub fn low(&self) -> SeqNum {
        self.stable.next()
    }

    /// High watermark: one past the last assignable sequence.
    pub fn high(&self) -> SeqNum {
        SeqNum(self.stable.0 + self.window + 1)
    }

    /// The latest stable checkpoint sequence.
    pub fn stable(&self) -> SeqNum {
        self.stable
    }

    /// Highest contiguously delivered sequence.
    pub fn delivered(&self) -> SeqNum {
        self.delivered
    }

    /// True if a sequence falls inside the watermark window.
    pub fn in_window(&self, seq: SeqNum) -> bool {
        seq > self.stable && seq.0 <= self.stable.0 + self.window
    }

    /// Claim the next sequence number, or `None` if the window is
    /// exhausted.
    pub fn assign_next_seq(&mut self) -> Option<SeqNum> {
        let seq = self.next_seq;
        if !self.in_window(seq) {
            return None;
        }
        self.next_seq = seq.next();
        Some(seq)
    }

    /// Force the assignment cursor forward (used when installing a new
    /// view). Never moves it backwards.
    pub fn bump_next_seq(&mut self, seq: SeqNum) {
        if seq > self.next_seq {
            self.next_seq = seq;
        }
    }

    /// The slot for a sequence, created on first touch. Callers must
    /// check `in_window` first.
    pub fn slot_mut(&mut self, seq: SeqNum) -> &mut Slot {
        self.slots.entry(seq).or_default()
    }

    /// The slot for a sequence, if it exists.
    pub fn slot(&self, seq: SeqNum) -> Option<&Slot> {
        self.slots.get(&seq)
    }

    /// True once a commit outcome is recorded for the sequence.
    pub fn is_committed(&self, seq: SeqNum) -> bool {
        self.committed.contains_key(&seq) || seq <= self.stable
    }

    /// Record a commit outcome. The first recording wins; committed
    /// entries never change.
    pub fn record_committed(&mut self, seq: SeqNum, entry: CommittedEntry) {
        self.committed.entry(seq).or_insert(entry);
    }

    /// The committed entry for a sequence, if retained.
    pub fn committed_entry(&self, seq: SeqNum) -> Option<&CommittedEntry> {
        self.committed.get(&seq)
    }

    /// Pop the next deliverable entry: the successor of `delivered`, if
    /// it has committed. Advances the delivery cursor.
    pub fn pop_deliverable(&mut self) -> Option<(SeqNum, CommittedEntry)> {
        let next = self.delivered.next();
        let entry = self.committed.get(&next)?.clone();
        self.delivered = next;
        Some((next, entry))
    }

    /// Install a stable checkpoint: advance the low watermark, discard
    /// the vote accumulators at or below it, and release committed
    /// entries that have already been delivered.
    ///
    /// The delivery cursor is never moved: delivery stays contiguous,
    /// so a replica that adopted a certificate ahead of its own
    /// delivery stalls its callback stream at the gap instead of
    /// skipping over it. Committed entries it still holds stay retained
    /// until delivered.
    pub fn install_stable(&mut self, seq: SeqNum) {
        if seq <= self.stable {
            return;
        }
        self.stable = seq;
        self.slots = self.slots.split_off(&seq.next());
        let released = SeqNum(seq.0.min(self.delivered.0));
        self.committed = self.committed.split_off(&released.next());
        if self.next_seq <= seq {
            self.next_seq = seq.next();
        }
    }

    /// Drop all in-flight slots (view installation: votes from the old
    /// view must not count toward the new one). Committed entries stay.
    pub fn clear_in_flight(&mut self) {
        self.slots.clear();
    }

    /// Prepared certificates for every in-flight sequence above the
    /// stable checkpoint, for inclusion in a view-change vote.
    pub fn prepared_proofs(&self, prepare_quorum: usize) -> Vec<PreparedProof> {
        self.slots
            .values()
            .filter_map(|slot| slot.prepared_proof(prepare_quorum))
            .collect()
    }

    /// Number of retained committed entries (observability).
    pub fn committed_len(&self) -> usize {
        self.committed.len()
    }

    /// Number of live slots (observability).
    pub fn slots_len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(tag: &[u8]) -> CommittedEntry {
        CommittedEntry {
            digest: Hash::from_bytes(tag),
            request: None,
        }
    }

    #[test]
    fn test_window_bounds() {
        let log = ReplicaLog::new(10);
        assert!(!log.in_window(SeqNum(0)));
        assert!(log.in_window(SeqNum(1)));
        assert!(log.in_window(SeqNum(10)));
        assert!(!log.in_window(SeqNum(11)));
    }

    #[test]
    fn test_assignment_exhausts_window() {
        let mut log = ReplicaLog::new(3);
        assert_eq!(log.assign_next_seq(), Some(SeqNum(1)));
        assert_eq!(log.assign_next_seq(), Some(SeqNum(2)));
        assert_eq!(log.assign_next_seq(), Some(SeqNum(3)));
        assert_eq!(log.assign_next_seq(), None);
    }

    #[test]
    fn test_stable_advances_window() {
        let mut log = ReplicaLog::new(3);
        for _ in 0..3 {
            log.assign_next_seq();
        }
        assert_eq!(log.assign_next_seq(), None);

        log.install_stable(SeqNum(3));
        assert_eq!(log.low(), SeqNum(4));
        assert!(log.in_window(SeqNum(6)));
        assert_eq!(log.assign_next_seq(), Some(SeqNum(4)));
    }

    #[test]
    fn test_in_order_delivery_with_gap() {
        let mut log = ReplicaLog::new(10);
        log.record_committed(SeqNum(2), entry(b"b"));
        // Gap at 1: nothing deliverable yet.
        assert!(log.pop_deliverable().is_none());

        log.record_committed(SeqNum(1), entry(b"a"));
        assert_eq!(log.pop_deliverable().map(|(s, _)| s), Some(SeqNum(1)));
        assert_eq!(log.pop_deliverable().map(|(s, _)| s), Some(SeqNum(2)));
        assert!(log.pop_deliverable().is_none());
    }

    #[test]
    fn test_committed_entries_immutable() {
        let mut log = ReplicaLog::new(10);
        log.record_committed(SeqNum(1), entry(b"first"));
        log.record_committed(SeqNum(1), entry(b"second"));
        assert_eq!(
            log.committed_entry(SeqNum(1)).map(|e| e.digest),
            Some(Hash::from_bytes(b"first"))
        );
    }

    #[test]
    fn test_install_stable_prunes() {
        let mut log = ReplicaLog::new(10);
        log.record_committed(SeqNum(1), entry(b"a"));
        log.record_committed(SeqNum(2), entry(b"b"));
        log.pop_deliverable();
        log.pop_deliverable();
        log.slot_mut(SeqNum(2));
        log.slot_mut(SeqNum(3));

        log.install_stable(SeqNum(2));
        assert_eq!(log.committed_len(), 0);
        assert_eq!(log.slots_len(), 1);
        assert!(log.is_committed(SeqNum(1)));
        assert_eq!(log.delivered(), SeqNum(2));
    }

    #[test]
    fn test_install_stable_never_moves_delivery_cursor() {
        let mut log = ReplicaLog::new(10);
        log.record_committed(SeqNum(1), entry(b"a"));
        log.pop_deliverable();

        // Certificate two sequences ahead of local delivery.
        log.install_stable(SeqNum(3));
        assert_eq!(log.stable(), SeqNum(3));
        assert_eq!(log.delivered(), SeqNum(1));
        // Nothing committed at 2: delivery stalls instead of skipping.
        assert!(log.pop_deliverable().is_none());
    }

    #[test]
    fn test_install_stable_retains_undelivered_entries() {
        let mut log = ReplicaLog::new(10);
        log.record_committed(SeqNum(1), entry(b"a"));
        log.record_committed(SeqNum(2), entry(b"b"));
        log.pop_deliverable();

        // Seq 2 committed but not yet delivered when the certificate
        // lands: it must survive the prune and deliver afterwards.
        log.install_stable(SeqNum(2));
        assert_eq!(log.committed_len(), 1);
        assert_eq!(log.pop_deliverable().map(|(s, _)| s), Some(SeqNum(2)));
    }
}
