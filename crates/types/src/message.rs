//! Protocol messages exchanged between replicas.
//!
//! All messages are replica-signed. The set of message kinds is closed:
//! anything else arriving on the wire is rejected at the boundary.

use crate::{
    signing, ClientRequest, Hash, KeyPair, ReplicaId, SeqNum, Signature, View,
};

/// The primary's proposal binding `(view, seq)` to a request digest.
///
/// Carries the full request so backups can deliver the payload once the
/// slot commits. A null proposal (gap filler from a NewView) has the
/// zero digest and no request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrePrepare {
    /// View in which the proposal was made.
    pub view: View,
    /// Assigned sequence number.
    pub seq: SeqNum,
    /// Digest of the proposed request (zero for a null proposal).
    pub digest: Hash,
    /// The request itself; absent for null proposals.
    pub request: Option<ClientRequest>,
    /// The proposing primary.
    pub replica: ReplicaId,
    /// Signature over the signing message.
    pub signature: Signature,
}

impl PrePrepare {
    /// Construct and sign a proposal.
    pub fn signed(
        key: &KeyPair,
        replica: ReplicaId,
        view: View,
        seq: SeqNum,
        request: ClientRequest,
    ) -> Self {
        let digest = request.digest();
        let signature = key.sign(&signing::pre_prepare_message(view, seq, &digest));
        Self {
            view,
            seq,
            digest,
            request: Some(request),
            replica,
            signature,
        }
    }

    /// Construct and sign a null proposal for a gap left by a view change.
    pub fn signed_null(key: &KeyPair, replica: ReplicaId, view: View, seq: SeqNum) -> Self {
        let digest = Hash::ZERO;
        let signature = key.sign(&signing::pre_prepare_message(view, seq, &digest));
        Self {
            view,
            seq,
            digest,
            request: None,
            replica,
            signature,
        }
    }

    /// True if this proposes the null request.
    pub fn is_null(&self) -> bool {
        self.digest.is_zero()
    }

    /// The canonical bytes the signature covers.
    pub fn signing_message(&self) -> Vec<u8> {
        signing::pre_prepare_message(self.view, self.seq, &self.digest)
    }
}

/// A backup's vote endorsing the primary's proposal for `(view, seq)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepare {
    /// View the vote belongs to.
    pub view: View,
    /// Sequence number the vote is for.
    pub seq: SeqNum,
    /// Digest the voter endorses.
    pub digest: Hash,
    /// The voting backup.
    pub replica: ReplicaId,
    /// Signature over the signing message.
    pub signature: Signature,
}

impl Prepare {
    /// Construct and sign a prepare vote.
    pub fn signed(key: &KeyPair, replica: ReplicaId, view: View, seq: SeqNum, digest: Hash) -> Self {
        let signature = key.sign(&signing::prepare_message(view, seq, &digest));
        Self {
            view,
            seq,
            digest,
            replica,
            signature,
        }
    }

    /// The canonical bytes the signature covers.
    pub fn signing_message(&self) -> Vec<u8> {
        signing::prepare_message(self.view, self.seq, &self.digest)
    }
}

/// A replica's attestation that `(view, seq, digest)` is prepared at a
/// quorum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    /// View the vote belongs to.
    pub view: View,
    /// Sequence number the vote is for.
    pub seq: SeqNum,
    /// Digest the voter commits to.
    pub digest: Hash,
    /// The voting replica.
    pub replica: ReplicaId,
    /// Signature over the signing message.
    pub signature: Signature,
}

impl Commit {
    /// Construct and sign a commit vote.
    pub fn signed(key: &KeyPair, replica: ReplicaId, view: View, seq: SeqNum, digest: Hash) -> Self {
        let signature = key.sign(&signing::commit_message(view, seq, &digest));
        Self {
            view,
            seq,
            digest,
            replica,
            signature,
        }
    }

    /// The canonical bytes the signature covers.
    pub fn signing_message(&self) -> Vec<u8> {
        signing::commit_message(self.view, self.seq, &self.digest)
    }
}

/// A replica's attestation of its delivered-state digest at a checkpoint
/// boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// The checkpoint sequence number (a multiple of the interval).
    pub seq: SeqNum,
    /// Digest summarizing everything delivered up to `seq`.
    pub state_digest: Hash,
    /// The attesting replica.
    pub replica: ReplicaId,
    /// Signature over the signing message.
    pub signature: Signature,
}

impl Checkpoint {
    /// Construct and sign a checkpoint attestation.
    pub fn signed(key: &KeyPair, replica: ReplicaId, seq: SeqNum, state_digest: Hash) -> Self {
        let signature = key.sign(&signing::checkpoint_message(seq, &state_digest));
        Self {
            seq,
            state_digest,
            replica,
            signature,
        }
    }

    /// The canonical bytes the signature covers.
    pub fn signing_message(&self) -> Vec<u8> {
        signing::checkpoint_message(self.seq, &self.state_digest)
    }
}

/// A prepared certificate: the primary's PrePrepare plus `2f` matching
/// backup Prepares. Proof that a quorum agreed on the digest in some
/// view, carried into view changes so the assignment survives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedProof {
    /// The certified proposal.
    pub pre_prepare: PrePrepare,
    /// Matching backup votes (`2f` distinct, primary excluded).
    pub prepares: Vec<Prepare>,
}

impl PreparedProof {
    /// The sequence number this certificate covers.
    pub fn seq(&self) -> SeqNum {
        self.pre_prepare.seq
    }
}

/// A replica's vote to abandon the current view.
///
/// Carries the evidence the next primary needs: the voter's latest
/// stable checkpoint with its certificate, and prepared certificates for
/// every sequence above it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewChange {
    /// The view being voted for.
    pub new_view: View,
    /// The voter's latest stable checkpoint `(seq, state digest)`.
    pub last_stable: (SeqNum, Hash),
    /// `2f+1` Checkpoint attestations certifying `last_stable`. Empty at
    /// genesis, before any checkpoint has stabilized.
    pub checkpoint_proof: Vec<Checkpoint>,
    /// Prepared certificates for sequences above the stable checkpoint.
    pub prepared: Vec<PreparedProof>,
    /// The voting replica.
    pub replica: ReplicaId,
    /// Signature over the signing message.
    pub signature: Signature,
}

impl ViewChange {
    /// Construct and sign a view-change vote.
    pub fn signed(
        key: &KeyPair,
        replica: ReplicaId,
        new_view: View,
        last_stable: (SeqNum, Hash),
        checkpoint_proof: Vec<Checkpoint>,
        prepared: Vec<PreparedProof>,
    ) -> Self {
        let signature = key.sign(&signing::view_change_message(
            new_view,
            last_stable,
            &checkpoint_proof,
            &prepared,
        ));
        Self {
            new_view,
            last_stable,
            checkpoint_proof,
            prepared,
            replica,
            signature,
        }
    }

    /// The canonical bytes the signature covers.
    pub fn signing_message(&self) -> Vec<u8> {
        signing::view_change_message(
            self.new_view,
            self.last_stable,
            &self.checkpoint_proof,
            &self.prepared,
        )
    }
}

/// The new primary's announcement installing a view.
///
/// Proves legitimacy with `2f+1` ViewChange votes and carries the
/// re-proposed PrePrepares every backup must adopt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewView {
    /// The view being installed.
    pub view: View,
    /// `2f+1` supporting votes from distinct replicas.
    pub view_changes: Vec<ViewChange>,
    /// Re-proposals for the in-flight window, in sequence order; gaps
    /// are filled with null proposals.
    pub pre_prepares: Vec<PrePrepare>,
    /// The announcing primary.
    pub replica: ReplicaId,
    /// Signature over the signing message.
    pub signature: Signature,
}

impl NewView {
    /// Construct and sign a new-view announcement.
    pub fn signed(
        key: &KeyPair,
        replica: ReplicaId,
        view: View,
        view_changes: Vec<ViewChange>,
        pre_prepares: Vec<PrePrepare>,
    ) -> Self {
        let signature = key.sign(&signing::new_view_message(view, &view_changes, &pre_prepares));
        Self {
            view,
            view_changes,
            pre_prepares,
            replica,
            signature,
        }
    }

    /// The canonical bytes the signature covers.
    pub fn signing_message(&self) -> Vec<u8> {
        signing::new_view_message(self.view, &self.view_changes, &self.pre_prepares)
    }
}

/// The closed set of replica-to-replica messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusMessage {
    /// Primary proposal.
    PrePrepare(PrePrepare),
    /// Backup endorsement vote.
    Prepare(Prepare),
    /// Commit vote.
    Commit(Commit),
    /// Checkpoint attestation.
    Checkpoint(Checkpoint),
    /// View-change vote.
    ViewChange(ViewChange),
    /// New-view installation.
    NewView(NewView),
}

impl ConsensusMessage {
    /// The declared sender.
    pub fn replica(&self) -> ReplicaId {
        match self {
            ConsensusMessage::PrePrepare(m) => m.replica,
            ConsensusMessage::Prepare(m) => m.replica,
            ConsensusMessage::Commit(m) => m.replica,
            ConsensusMessage::Checkpoint(m) => m.replica,
            ConsensusMessage::ViewChange(m) => m.replica,
            ConsensusMessage::NewView(m) => m.replica,
        }
    }

    /// The signature over the signing message.
    pub fn signature(&self) -> &Signature {
        match self {
            ConsensusMessage::PrePrepare(m) => &m.signature,
            ConsensusMessage::Prepare(m) => &m.signature,
            ConsensusMessage::Commit(m) => &m.signature,
            ConsensusMessage::Checkpoint(m) => &m.signature,
            ConsensusMessage::ViewChange(m) => &m.signature,
            ConsensusMessage::NewView(m) => &m.signature,
        }
    }

    /// The canonical bytes the signature covers.
    pub fn signing_message(&self) -> Vec<u8> {
        match self {
            ConsensusMessage::PrePrepare(m) => m.signing_message(),
            ConsensusMessage::Prepare(m) => m.signing_message(),
            ConsensusMessage::Commit(m) => m.signing_message(),
            ConsensusMessage::Checkpoint(m) => m.signing_message(),
            ConsensusMessage::ViewChange(m) => m.signing_message(),
            ConsensusMessage::NewView(m) => m.signing_message(),
        }
    }

    /// Message kind name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            ConsensusMessage::PrePrepare(_) => "PrePrepare",
            ConsensusMessage::Prepare(_) => "Prepare",
            ConsensusMessage::Commit(_) => "Commit",
            ConsensusMessage::Checkpoint(_) => "Checkpoint",
            ConsensusMessage::ViewChange(_) => "ViewChange",
            ConsensusMessage::NewView(_) => "NewView",
        }
    }
}
