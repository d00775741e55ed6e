//! Per-sequence slot state: one slot tracks one sequence number through
//! the three protocol phases.

use std::collections::BTreeMap;

use pbft_types::{Commit, Hash, PrePrepare, Prepare, PreparedProof, ReplicaId};

/// How far a slot has progressed. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SlotPhase {
    /// Nothing accepted yet (votes may already be buffered).
    Idle,
    /// The primary's proposal was accepted.
    PrePrepared,
    /// Prepared certificate reached: proposal plus a prepare quorum.
    Prepared,
    /// Commit quorum reached; awaiting in-order delivery.
    Committed,
}

/// Vote accumulator for a single sequence number.
///
/// Votes are deduplicated by signer and may arrive before the proposal;
/// quorums only count votes whose digest matches the accepted proposal.
#[derive(Debug, Clone, Default)]
pub struct Slot {
    pre_prepare: Option<PrePrepare>,
    prepares: BTreeMap<ReplicaId, Prepare>,
    commits: BTreeMap<ReplicaId, Commit>,
}

impl Slot {
    /// Create an empty slot.
    pub fn new() -> Self {
        Self::default()
    }

    /// The accepted proposal, if any.
    pub fn pre_prepare(&self) -> Option<&PrePrepare> {
        self.pre_prepare.as_ref()
    }

    /// The digest of the accepted proposal, if any.
    pub fn accepted_digest(&self) -> Option<Hash> {
        self.pre_prepare.as_ref().map(|pp| pp.digest)
    }

    /// Accept the primary's proposal. Conflicting-digest detection
    /// happens before this is called; the first accepted proposal wins.
    pub fn set_pre_prepare(&mut self, pre_prepare: PrePrepare) {
        if self.pre_prepare.is_none() {
            self.pre_prepare = Some(pre_prepare);
        }
    }

    /// Record a prepare vote. The first vote per replica wins; later
    /// ones from the same signer are dropped.
    pub fn add_prepare(&mut self, prepare: Prepare) {
        self.prepares.entry(prepare.replica).or_insert(prepare);
    }

    /// Record a commit vote, first per replica wins.
    pub fn add_commit(&mut self, commit: Commit) {
        self.commits.entry(commit.replica).or_insert(commit);
    }

    /// Count prepares matching the accepted digest, excluding the
    /// proposing primary (its PrePrepare stands in for a prepare).
    fn matching_prepares(&self) -> usize {
        match &self.pre_prepare {
            Some(pp) => self
                .prepares
                .values()
                .filter(|p| p.digest == pp.digest && p.replica != pp.replica)
                .count(),
            None => 0,
        }
    }

    /// Count commits matching the accepted digest.
    fn matching_commits(&self) -> usize {
        match &self.pre_prepare {
            Some(pp) => self
                .commits
                .values()
                .filter(|c| c.digest == pp.digest)
                .count(),
            None => 0,
        }
    }

    /// True once the prepared certificate exists: an accepted proposal
    /// plus `prepare_quorum` matching backup votes.
    pub fn is_prepared(&self, prepare_quorum: usize) -> bool {
        self.pre_prepare.is_some() && self.matching_prepares() >= prepare_quorum
    }

    /// True once `quorum` matching commit votes exist on a prepared slot.
    pub fn is_committed(&self, prepare_quorum: usize, quorum: usize) -> bool {
        self.is_prepared(prepare_quorum) && self.matching_commits() >= quorum
    }

    /// The phase the slot is in right now. Vote sets only grow, so the
    /// phase never regresses.
    pub fn phase(&self, prepare_quorum: usize, quorum: usize) -> SlotPhase {
        if self.is_committed(prepare_quorum, quorum) {
            SlotPhase::Committed
        } else if self.is_prepared(prepare_quorum) {
            SlotPhase::Prepared
        } else if self.pre_prepare.is_some() {
            SlotPhase::PrePrepared
        } else {
            SlotPhase::Idle
        }
    }

    /// Extract the prepared certificate, if the slot is prepared.
    pub fn prepared_proof(&self, prepare_quorum: usize) -> Option<PreparedProof> {
        let pp = self.pre_prepare.as_ref()?;
        let prepares: Vec<Prepare> = self
            .prepares
            .values()
            .filter(|p| p.digest == pp.digest && p.replica != pp.replica)
            .take(prepare_quorum)
            .cloned()
            .collect();
        if prepares.len() < prepare_quorum {
            return None;
        }
        Some(PreparedProof {
            pre_prepare: pp.clone(),
            prepares,
        })
    }

    /// True if this replica's commit vote is already recorded.
    pub fn has_commit_from(&self, replica: ReplicaId) -> bool {
        self.commits.contains_key(&replica)
    }

    /// True if this replica's prepare vote is already recorded.
    pub fn has_prepare_from(&self, replica: ReplicaId) -> bool {
        self.prepares.contains_key(&replica)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbft_types::{ClientId, ClientRequest, KeyPair, SeqNum, View};

    fn key(i: u8) -> KeyPair {
        KeyPair::from_seed(&[i + 1; 32])
    }

    fn request() -> ClientRequest {
        ClientRequest::new(ClientId(1), 1, b"op".to_vec())
    }

    fn proposal() -> PrePrepare {
        PrePrepare::signed(&key(0), ReplicaId(0), View(0), SeqNum(1), request())
    }

    fn prepare(replica: u64, digest: Hash) -> Prepare {
        Prepare::signed(&key(replica as u8), ReplicaId(replica), View(0), SeqNum(1), digest)
    }

    fn commit(replica: u64, digest: Hash) -> Commit {
        Commit::signed(&key(replica as u8), ReplicaId(replica), View(0), SeqNum(1), digest)
    }

    #[test]
    fn test_prepared_needs_proposal_and_quorum() {
        let mut slot = Slot::new();
        let digest = request().digest();

        slot.add_prepare(prepare(1, digest));
        slot.add_prepare(prepare(2, digest));
        // Votes alone never prepare a slot.
        assert!(!slot.is_prepared(2));

        slot.set_pre_prepare(proposal());
        assert!(slot.is_prepared(2));
        assert_eq!(slot.phase(2, 3), SlotPhase::Prepared);
    }

    #[test]
    fn test_mismatched_digests_do_not_count() {
        let mut slot = Slot::new();
        slot.set_pre_prepare(proposal());

        let other = Hash::from_bytes(b"different");
        slot.add_prepare(prepare(1, other));
        slot.add_prepare(prepare(2, other));
        assert!(!slot.is_prepared(2));
    }

    #[test]
    fn test_primary_prepare_is_not_counted() {
        let mut slot = Slot::new();
        let digest = request().digest();
        slot.set_pre_prepare(proposal());

        slot.add_prepare(prepare(0, digest));
        slot.add_prepare(prepare(1, digest));
        // Only replica-1 counts; replica-0 is the proposer.
        assert!(!slot.is_prepared(2));
    }

    #[test]
    fn test_duplicate_votes_deduplicated() {
        let mut slot = Slot::new();
        let digest = request().digest();
        slot.set_pre_prepare(proposal());

        slot.add_prepare(prepare(1, digest));
        slot.add_prepare(prepare(1, digest));
        assert!(!slot.is_prepared(2));
    }

    #[test]
    fn test_commit_quorum() {
        let mut slot = Slot::new();
        let digest = request().digest();
        slot.set_pre_prepare(proposal());
        slot.add_prepare(prepare(1, digest));
        slot.add_prepare(prepare(2, digest));

        slot.add_commit(commit(0, digest));
        slot.add_commit(commit(1, digest));
        assert!(!slot.is_committed(2, 3));

        slot.add_commit(commit(2, digest));
        assert!(slot.is_committed(2, 3));
        assert_eq!(slot.phase(2, 3), SlotPhase::Committed);
    }

    #[test]
    fn test_prepared_proof_extraction() {
        let mut slot = Slot::new();
        let digest = request().digest();
        slot.set_pre_prepare(proposal());
        slot.add_prepare(prepare(1, digest));

        assert!(slot.prepared_proof(2).is_none());

        slot.add_prepare(prepare(2, digest));
        let proof = slot.prepared_proof(2).unwrap();
        assert_eq!(proof.seq(), SeqNum(1));
        assert_eq!(proof.prepares.len(), 2);
    }
}
