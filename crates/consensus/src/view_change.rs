//! View-change machinery: vote tracking, escalation backoff, and
//! construction/validation of NewView announcements.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tracing::debug;

use pbft_types::{
    signing, Checkpoint, Hash, KeyPair, NewView, PrePrepare, PreparedProof, ReplicaId, SeqNum,
    View, ViewChange,
};

use crate::authenticator::MessageAuthenticator;

/// Doubling cap for the view-change timeout: it never exceeds
/// `2^6` times the base.
const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Whether the replica is ordering normally or voting to change views.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewStatus {
    /// In-view, ordering requests.
    Normal,
    /// Voted to abandon the current view; ordering is paused.
    ViewChanging {
        /// The view being voted for.
        target: View,
    },
}

/// View-change progress for one replica: the installed view, collected
/// votes for higher views, and the escalation backoff.
#[derive(Debug)]
pub struct ViewChangeState {
    view: View,
    status: ViewStatus,
    /// Validated votes per target view, deduplicated by voter.
    votes: BTreeMap<View, BTreeMap<ReplicaId, ViewChange>>,
    backoff_exponent: u32,
}

impl ViewChangeState {
    /// Start in the genesis view, operating normally.
    pub fn new() -> Self {
        Self {
            view: View::GENESIS,
            status: ViewStatus::Normal,
            votes: BTreeMap::new(),
            backoff_exponent: 0,
        }
    }

    /// The currently installed view.
    pub fn view(&self) -> View {
        self.view
    }

    /// Normal operation or mid-change.
    pub fn status(&self) -> ViewStatus {
        self.status
    }

    /// True while a view change is in progress.
    pub fn is_changing(&self) -> bool {
        matches!(self.status, ViewStatus::ViewChanging { .. })
    }

    /// The highest view we are committed to: the change target if one is
    /// in progress, otherwise the installed view.
    pub fn effective_view(&self) -> View {
        match self.status {
            ViewStatus::Normal => self.view,
            ViewStatus::ViewChanging { target } => target,
        }
    }

    /// The current escalation timeout for a given base.
    pub fn timeout(&self, base: Duration) -> Duration {
        base * 2u32.pow(self.backoff_exponent.min(MAX_BACKOFF_EXPONENT))
    }

    /// Enter (or re-enter) view-changing state toward `target`.
    pub fn begin(&mut self, target: View) {
        debug!(from = %self.view, to = %target, "starting view change");
        self.status = ViewStatus::ViewChanging { target };
    }

    /// Escalate to the next view after a failed change, doubling the
    /// backoff. Returns the new target.
    pub fn escalate(&mut self) -> View {
        let target = self.effective_view().next();
        if self.backoff_exponent < MAX_BACKOFF_EXPONENT {
            self.backoff_exponent += 1;
        }
        self.status = ViewStatus::ViewChanging { target };
        target
    }

    /// Reset the backoff after real progress in the installed view.
    pub fn note_progress(&mut self) {
        if matches!(self.status, ViewStatus::Normal) {
            self.backoff_exponent = 0;
        }
    }

    /// Record a validated vote. Votes for the installed view or below
    /// are stale and dropped.
    pub fn record_vote(&mut self, vote: ViewChange) {
        if vote.new_view <= self.view {
            return;
        }
        self.votes
            .entry(vote.new_view)
            .or_default()
            .entry(vote.replica)
            .or_insert(vote);
    }

    /// Number of distinct voters for a target view.
    pub fn votes_for(&self, view: View) -> usize {
        self.votes.get(&view).map_or(0, |v| v.len())
    }

    /// The collected votes for a target view, in voter order.
    pub fn quorum_votes(&self, view: View) -> Vec<ViewChange> {
        self.votes
            .get(&view)
            .map(|v| v.values().cloned().collect())
            .unwrap_or_default()
    }

    /// The join rule: once `f + 1` distinct replicas vote for views
    /// above our own commitment, joining the smallest of those views is
    /// safe (at least one voter is honest). Returns that view.
    pub fn join_candidate(&self, faults: usize) -> Option<View> {
        let floor = self.effective_view();
        let mut voters: BTreeSet<ReplicaId> = BTreeSet::new();
        let mut smallest: Option<View> = None;
        for (&view, votes) in self.votes.range(floor.next()..) {
            voters.extend(votes.keys());
            if smallest.is_none() {
                smallest = Some(view);
            }
        }
        if voters.len() >= faults + 1 {
            smallest
        } else {
            None
        }
    }

    /// Install a view: return to normal operation and drop votes that
    /// can no longer matter.
    pub fn install(&mut self, view: View) {
        debug!(view = %view, "installing view");
        self.view = view;
        self.status = ViewStatus::Normal;
        self.votes = self.votes.split_off(&view.next());
        self.backoff_exponent = 0;
    }
}

impl Default for ViewChangeState {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a view-change vote or NewView announcement was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NewViewError {
    /// The announcer is not the primary of the announced view.
    #[error("{replica} is not the primary of {view}")]
    WrongPrimary {
        /// The announcing replica.
        replica: ReplicaId,
        /// The announced view.
        view: View,
    },

    /// Fewer than `2f+1` distinct supporting votes.
    #[error("only {actual} distinct votes, need {required}")]
    InsufficientVotes {
        /// Votes present.
        actual: usize,
        /// Quorum size.
        required: usize,
    },

    /// A supporting vote was invalid.
    #[error("invalid supporting vote from {0}")]
    InvalidVote(ReplicaId),

    /// The embedded proposals do not match what the votes dictate.
    #[error("re-proposal mismatch at {0}")]
    ProposalMismatch(SeqNum),

    /// An embedded proposal carries a bad signature or wrong view.
    #[error("malformed re-proposal at {0}")]
    MalformedProposal(SeqNum),
}

/// Validate the evidence inside a view-change vote.
///
/// The outer signature has already been checked by the runner; this
/// verifies the nested checkpoint certificate and prepared
/// certificates inline.
pub fn validate_view_change_evidence(
    vote: &ViewChange,
    auth: &MessageAuthenticator,
    quorum: usize,
    prepare_quorum: usize,
) -> bool {
    let (stable_seq, stable_digest) = vote.last_stable;

    // Genesis needs no certificate; anything later needs 2f+1 matching
    // attestations from distinct replicas.
    if stable_seq > SeqNum::ZERO {
        let mut attesters = BTreeSet::new();
        for cp in &vote.checkpoint_proof {
            if cp.seq != stable_seq || cp.state_digest != stable_digest {
                continue;
            }
            if !auth.verify_member(cp.replica, &cp.signing_message(), &cp.signature) {
                continue;
            }
            attesters.insert(cp.replica);
        }
        if attesters.len() < quorum {
            return false;
        }
    }

    for proof in &vote.prepared {
        if !validate_prepared_proof(proof, auth, prepare_quorum) {
            return false;
        }
        if proof.seq() <= stable_seq {
            return false;
        }
    }
    true
}

/// Check a prepared certificate: a signed proposal plus `2f` matching
/// backup votes from distinct replicas.
pub fn validate_prepared_proof(
    proof: &PreparedProof,
    auth: &MessageAuthenticator,
    prepare_quorum: usize,
) -> bool {
    let pp = &proof.pre_prepare;
    if !auth.verify_member(pp.replica, &pp.signing_message(), &pp.signature) {
        return false;
    }
    let mut voters = BTreeSet::new();
    for prepare in &proof.prepares {
        if prepare.view != pp.view
            || prepare.seq != pp.seq
            || prepare.digest != pp.digest
            || prepare.replica == pp.replica
        {
            continue;
        }
        if !auth.verify_member(prepare.replica, &prepare.signing_message(), &prepare.signature) {
            continue;
        }
        voters.insert(prepare.replica);
    }
    voters.len() >= prepare_quorum
}

/// The log baseline and re-proposals a set of view-change votes
/// dictates.
struct NewViewPlan {
    /// Highest certified stable checkpoint across the votes.
    stable: (SeqNum, Hash),
    /// Its certificate.
    stable_proof: Vec<Checkpoint>,
    /// `(seq, digest, request)` for every slot above the baseline, with
    /// gaps mapped to the null digest.
    proposals: Vec<(SeqNum, Hash, Option<pbft_types::ClientRequest>)>,
}

fn plan_new_view(votes: &[ViewChange]) -> NewViewPlan {
    let mut stable = (SeqNum::ZERO, Hash::ZERO);
    let mut stable_proof: Vec<Checkpoint> = Vec::new();
    for vote in votes {
        if vote.last_stable.0 > stable.0 {
            stable = vote.last_stable;
            stable_proof = vote.checkpoint_proof.clone();
        }
    }

    // For each sequence above the baseline, the certificate from the
    // highest view wins; its digest is what must be re-proposed.
    let mut best: BTreeMap<SeqNum, &PreparedProof> = BTreeMap::new();
    for vote in votes {
        for proof in &vote.prepared {
            let seq = proof.seq();
            if seq <= stable.0 {
                continue;
            }
            let replace = best
                .get(&seq)
                .map_or(true, |cur| proof.pre_prepare.view > cur.pre_prepare.view);
            if replace {
                best.insert(seq, proof);
            }
        }
    }

    let max_seq = best.keys().next_back().copied().unwrap_or(stable.0);
    let mut proposals = Vec::new();
    let mut seq = stable.0.next();
    while seq <= max_seq {
        match best.get(&seq) {
            Some(proof) => proposals.push((
                seq,
                proof.pre_prepare.digest,
                proof.pre_prepare.request.clone(),
            )),
            None => proposals.push((seq, Hash::ZERO, None)),
        }
        seq = seq.next();
    }

    NewViewPlan {
        stable,
        stable_proof,
        proposals,
    }
}

/// Build a NewView announcement from a quorum of votes: re-propose
/// every certified assignment in the new view and fill gaps with null
/// proposals.
pub fn build_new_view(
    key: &KeyPair,
    local: ReplicaId,
    view: View,
    votes: Vec<ViewChange>,
) -> NewView {
    let plan = plan_new_view(&votes);
    let pre_prepares = plan
        .proposals
        .into_iter()
        .map(|(seq, digest, request)| {
            let signature = key.sign(&signing::pre_prepare_message(view, seq, &digest));
            PrePrepare {
                view,
                seq,
                digest,
                request,
                replica: local,
                signature,
            }
        })
        .collect();
    NewView::signed(key, local, view, votes, pre_prepares)
}

/// What a validated NewView installs on a backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedNewView {
    /// The stable checkpoint the announcement is built on.
    pub stable: (SeqNum, Hash),
    /// Its certificate.
    pub stable_proof: Vec<Checkpoint>,
}

/// Validate a NewView announcement against its own evidence.
///
/// The announcer's outer signature has already been checked. Verifies
/// the supporting votes (signatures and nested evidence), recomputes
/// the dictated re-proposals, and requires the embedded ones to match
/// exactly.
pub fn validate_new_view(
    new_view: &NewView,
    auth: &MessageAuthenticator,
    expected_primary: ReplicaId,
    quorum: usize,
    prepare_quorum: usize,
) -> Result<ValidatedNewView, NewViewError> {
    if new_view.replica != expected_primary {
        return Err(NewViewError::WrongPrimary {
            replica: new_view.replica,
            view: new_view.view,
        });
    }

    let mut voters = BTreeSet::new();
    for vote in &new_view.view_changes {
        if vote.new_view != new_view.view {
            return Err(NewViewError::InvalidVote(vote.replica));
        }
        if !auth.verify_member(vote.replica, &vote.signing_message(), &vote.signature) {
            return Err(NewViewError::InvalidVote(vote.replica));
        }
        if !validate_view_change_evidence(vote, auth, quorum, prepare_quorum) {
            return Err(NewViewError::InvalidVote(vote.replica));
        }
        voters.insert(vote.replica);
    }
    if voters.len() < quorum {
        return Err(NewViewError::InsufficientVotes {
            actual: voters.len(),
            required: quorum,
        });
    }

    let plan = plan_new_view(&new_view.view_changes);
    if new_view.pre_prepares.len() != plan.proposals.len() {
        let seq = plan
            .proposals
            .first()
            .map(|(s, _, _)| *s)
            .unwrap_or_else(|| plan.stable.0.next());
        return Err(NewViewError::ProposalMismatch(seq));
    }
    for (pp, (seq, digest, _)) in new_view.pre_prepares.iter().zip(&plan.proposals) {
        if pp.seq != *seq || pp.digest != *digest {
            return Err(NewViewError::ProposalMismatch(*seq));
        }
        if pp.view != new_view.view || pp.replica != new_view.replica {
            return Err(NewViewError::MalformedProposal(*seq));
        }
        if !auth.verify_member(pp.replica, &pp.signing_message(), &pp.signature) {
            return Err(NewViewError::MalformedProposal(*seq));
        }
    }

    Ok(ValidatedNewView {
        stable: plan.stable,
        stable_proof: plan.stable_proof,
    })
}
