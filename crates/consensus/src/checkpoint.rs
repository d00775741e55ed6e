//! Checkpointing: periodic attestation of the delivered prefix, quorum
//! stabilization, and the divergence check that catches state forks.

use std::collections::BTreeMap;

use pbft_types::{Checkpoint, Hash, ReplicaId, SeqNum};

/// What processing a checkpoint attestation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointOutcome {
    /// No quorum yet.
    Pending,
    /// A quorum certified this checkpoint; it is now stable.
    Stable {
        /// The stabilized sequence.
        seq: SeqNum,
        /// The certified state digest.
        digest: Hash,
    },
    /// A quorum certified a digest that contradicts our own attestation
    /// at the same sequence. Unrecoverable.
    Divergence {
        /// The disputed sequence.
        seq: SeqNum,
        /// What we attested.
        local: Hash,
        /// What the quorum certified.
        certified: Hash,
    },
}

/// Checkpoint state for one replica.
///
/// The state digest is a running chain over delivered slots:
/// `d' = H(d || seq || digest)`, so equal digests at a boundary imply
/// equal delivered prefixes.
#[derive(Debug)]
pub struct CheckpointState {
    interval: u64,
    /// Running chained digest over everything delivered so far.
    running: Hash,
    /// Highest sequence folded into `running`, whether by local
    /// delivery or by adopting a certificate ahead of it.
    folded: SeqNum,
    /// Latest stable checkpoint `(seq, digest)`; `(0, ZERO)` at genesis.
    stable: (SeqNum, Hash),
    /// The certificate behind `stable`. Empty at genesis.
    stable_proof: Vec<Checkpoint>,
    /// Our own attestations at boundaries not yet stabilized.
    own_digests: BTreeMap<SeqNum, Hash>,
    /// Collected attestations per boundary, deduplicated by signer.
    votes: BTreeMap<SeqNum, BTreeMap<ReplicaId, Checkpoint>>,
}

impl CheckpointState {
    /// Create genesis checkpoint state.
    pub fn new(interval: u64) -> Self {
        Self {
            interval,
            running: Hash::ZERO,
            folded: SeqNum::ZERO,
            stable: (SeqNum::ZERO, Hash::ZERO),
            stable_proof: Vec::new(),
            own_digests: BTreeMap::new(),
            votes: BTreeMap::new(),
        }
    }

    /// The latest stable checkpoint.
    pub fn stable(&self) -> (SeqNum, Hash) {
        self.stable
    }

    /// The certificate for the latest stable checkpoint.
    pub fn stable_proof(&self) -> &[Checkpoint] {
        &self.stable_proof
    }

    /// Fold a delivered slot into the running digest. Returns the
    /// `(seq, state digest)` to attest when `seq` is a boundary.
    ///
    /// Sequences already covered by an adopted certificate are skipped:
    /// the certified digest already accounts for them.
    pub fn on_deliver(&mut self, seq: SeqNum, digest: Hash) -> Option<(SeqNum, Hash)> {
        if seq <= self.folded {
            return None;
        }
        self.folded = seq;
        self.running = Hash::from_parts(&[
            self.running.as_bytes(),
            &seq.0.to_le_bytes(),
            digest.as_bytes(),
        ]);
        if seq.0 % self.interval == 0 {
            self.own_digests.insert(seq, self.running);
            Some((seq, self.running))
        } else {
            None
        }
    }

    /// Record an attestation (our own included) and check for a quorum.
    ///
    /// A quorum on a digest we also attested stabilizes the checkpoint.
    /// A quorum on a digest contradicting our attestation at the same
    /// sequence is a divergence. A quorum ahead of us is adopted as-is:
    /// the certificate vouches for the state we have not reached yet.
    pub fn on_checkpoint(&mut self, checkpoint: Checkpoint, quorum: usize) -> CheckpointOutcome {
        let seq = checkpoint.seq;
        if seq <= self.stable.0 {
            return CheckpointOutcome::Pending;
        }

        let votes = self.votes.entry(seq).or_default();
        votes.entry(checkpoint.replica).or_insert(checkpoint);

        // Count per digest; a quorum on any single digest decides.
        let mut counts: BTreeMap<Hash, usize> = BTreeMap::new();
        for vote in votes.values() {
            *counts.entry(vote.state_digest).or_insert(0) += 1;
        }
        let certified = match counts.iter().find(|(_, &count)| count >= quorum) {
            Some((&digest, _)) => digest,
            None => return CheckpointOutcome::Pending,
        };

        if let Some(&local) = self.own_digests.get(&seq) {
            if local != certified {
                return CheckpointOutcome::Divergence {
                    seq,
                    local,
                    certified,
                };
            }
        }

        let proof: Vec<Checkpoint> = self
            .votes
            .get(&seq)
            .map(|v| {
                v.values()
                    .filter(|c| c.state_digest == certified)
                    .take(quorum)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        self.install_stable(seq, certified, proof);
        CheckpointOutcome::Stable {
            seq,
            digest: certified,
        }
    }

    /// Adopt a certified stable checkpoint (from our own quorum or a
    /// view-change vote carrying a newer one). Monotonic.
    pub fn install_stable(&mut self, seq: SeqNum, digest: Hash, proof: Vec<Checkpoint>) {
        if seq <= self.stable.0 {
            return;
        }
        self.stable = (seq, digest);
        self.stable_proof = proof;
        // Only a certificate ahead of everything we folded ourselves
        // replaces the running value; otherwise our own chain already
        // covers it (and may extend past the boundary).
        if self.folded < seq {
            self.running = digest;
            self.folded = seq;
        }
        self.own_digests = self.own_digests.split_off(&seq.next());
        self.votes = self.votes.split_off(&seq.next());
    }

    /// True if we have delivered up to this boundary ourselves.
    pub fn attested(&self, seq: SeqNum) -> bool {
        self.own_digests.contains_key(&seq)
    }
}
