//! The replica orchestrator: routes validated events through the slot
//! log, checkpoint state, and view-change machinery, and emits the
//! resulting actions.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use pbft_core::{Action, RequestId, SubmitError, TimerId};
use pbft_types::{
    Checkpoint, ClientId, ClientRequest, Commit, ConsensusMessage, Hash, KeyPair, Membership,
    NewView, PrePrepare, Prepare, SeqNum, View, ViewChange,
};

use crate::authenticator::MessageAuthenticator;
use crate::checkpoint::{CheckpointOutcome, CheckpointState};
use crate::config::ConsensusConfig;
use crate::log::{CommittedEntry, ReplicaLog};
use crate::view_change::{
    build_new_view, validate_new_view, validate_view_change_evidence, ViewChangeState, ViewStatus,
};

/// The last delivered request per client, for idempotent resubmission.
#[derive(Debug, Clone, Copy)]
struct LastReply {
    nonce: u64,
    seq: SeqNum,
    digest: Hash,
}

/// Full protocol state for one replica.
///
/// Purely deterministic: every public method takes one input and
/// returns the actions it produced. All I/O, timers, and signature
/// checks are delegated to the runner through those actions.
pub struct ReplicaState {
    membership: Arc<Membership>,
    auth: MessageAuthenticator,
    config: ConsensusConfig,
    log: ReplicaLog,
    checkpoints: CheckpointState,
    view_change: ViewChangeState,
    /// Last delivered request per client.
    last_reply: BTreeMap<ClientId, LastReply>,
    /// Submission handles awaiting commitment, by request digest.
    pending: BTreeMap<Hash, RequestId>,
    /// Requests accepted for ordering but not yet delivered, kept so a
    /// new primary can re-propose them after a view change.
    backlog: Vec<ClientRequest>,
    /// Timers we have asked the runner to arm and not yet cancelled.
    /// Tracked so installing a view can sweep away every timer that
    /// belongs to the abandoned one.
    armed: BTreeSet<TimerId>,
    /// Set after an integrity alarm; the replica stops participating.
    halted: bool,
}

impl ReplicaState {
    /// Create a replica at genesis.
    pub fn new(key: KeyPair, membership: Arc<Membership>, config: ConsensusConfig) -> Self {
        let log = ReplicaLog::new(config.window_size);
        let checkpoints = CheckpointState::new(config.checkpoint_interval);
        Self {
            auth: MessageAuthenticator::new(key, membership.clone()),
            membership,
            config,
            log,
            checkpoints,
            view_change: ViewChangeState::new(),
            last_reply: BTreeMap::new(),
            pending: BTreeMap::new(),
            backlog: Vec::new(),
            armed: BTreeSet::new(),
            halted: false,
        }
    }

    /// The currently installed view.
    pub fn view(&self) -> View {
        self.view_change.view()
    }

    /// Highest contiguously delivered sequence.
    pub fn delivered(&self) -> SeqNum {
        self.log.delivered()
    }

    /// The latest stable checkpoint.
    pub fn stable(&self) -> (SeqNum, Hash) {
        self.checkpoints.stable()
    }

    /// True after an integrity alarm.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// The message authenticator (for the runner's verification path
    /// and observability).
    pub fn authenticator_mut(&mut self) -> &mut MessageAuthenticator {
        &mut self.auth
    }

    /// Build a timer action and record the timer as armed.
    fn set_timer(&mut self, id: TimerId, duration: Duration) -> Action {
        self.armed.insert(id);
        Action::SetTimer { id, duration }
    }

    /// Build a cancellation and forget the timer.
    fn cancel_timer(&mut self, id: TimerId) -> Action {
        self.armed.remove(&id);
        Action::CancelTimer { id }
    }

    // ════════════════════════════════════════════════════════════════
    // Inbound messages
    // ════════════════════════════════════════════════════════════════

    /// A message arrived off the wire: gate it on sender identity and
    /// request signature verification.
    pub fn on_message(&mut self, message: ConsensusMessage) -> Vec<Action> {
        if self.halted {
            return Vec::new();
        }
        self.auth.verification_request(message).into_iter().collect()
    }

    /// Signature verification finished; drop or dispatch.
    pub fn on_verified(&mut self, message: ConsensusMessage, valid: bool) -> Vec<Action> {
        if self.halted {
            return Vec::new();
        }
        if !valid {
            self.auth.record_invalid(&message);
            return Vec::new();
        }
        match message {
            ConsensusMessage::PrePrepare(pp) => self.on_pre_prepare(pp),
            ConsensusMessage::Prepare(p) => self.on_prepare(p),
            ConsensusMessage::Commit(c) => self.on_commit(c),
            ConsensusMessage::Checkpoint(cp) => self.on_checkpoint(cp),
            ConsensusMessage::ViewChange(vc) => self.on_view_change(vc),
            ConsensusMessage::NewView(nv) => self.on_new_view(nv),
        }
    }

    fn on_pre_prepare(&mut self, pp: PrePrepare) -> Vec<Action> {
        let view = self.view();
        if pp.view != view || self.view_change.is_changing() {
            debug!(seq = %pp.seq, got = %pp.view, current = %view, "ignoring out-of-view proposal");
            return Vec::new();
        }
        if pp.replica != self.membership.primary(pp.view) {
            warn!(sender = %pp.replica, view = %pp.view, "proposal from non-primary");
            return Vec::new();
        }
        // The digest must actually be the digest of the carried request
        // (or the null digest with no request).
        let consistent = match &pp.request {
            Some(request) => request.digest() == pp.digest,
            None => pp.is_null(),
        };
        if !consistent {
            warn!(sender = %pp.replica, seq = %pp.seq, "proposal digest does not match request");
            return Vec::new();
        }
        if !self.log.in_window(pp.seq) {
            debug!(seq = %pp.seq, low = %self.log.low(), "proposal outside watermark window");
            return Vec::new();
        }

        // Two proposals from the same primary for the same (view, seq)
        // with different digests is equivocation.
        if let Some(accepted) = self.log.slot_mut(pp.seq).accepted_digest() {
            if accepted != pp.digest {
                warn!(
                    primary = %pp.replica,
                    seq = %pp.seq,
                    "equivocating proposals detected, suspecting primary"
                );
                return self.suspect_primary();
            }
            return Vec::new();
        }

        let seq = pp.seq;
        let digest = pp.digest;
        self.log.slot_mut(seq).set_pre_prepare(pp);

        let mut actions = vec![self.set_timer(TimerId::Request(seq), self.config.request_timeout)];
        if !self.membership.is_primary(view) {
            let prepare = Prepare::signed(
                self.auth.key(),
                self.membership.local_id(),
                view,
                seq,
                digest,
            );
            self.log.slot_mut(seq).add_prepare(prepare.clone());
            actions.push(Action::Broadcast {
                message: ConsensusMessage::Prepare(prepare),
            });
        }
        actions.extend(self.advance_slot(seq));
        actions
    }

    fn on_prepare(&mut self, prepare: Prepare) -> Vec<Action> {
        let view = self.view();
        if prepare.view != view || self.view_change.is_changing() {
            return Vec::new();
        }
        if prepare.replica == self.membership.primary(prepare.view) {
            // The primary's proposal is its endorsement; a separate
            // prepare vote from it is a protocol violation.
            warn!(sender = %prepare.replica, seq = %prepare.seq, "prepare vote from primary");
            return Vec::new();
        }
        if !self.log.in_window(prepare.seq) {
            return Vec::new();
        }
        let seq = prepare.seq;
        self.log.slot_mut(seq).add_prepare(prepare);
        self.advance_slot(seq)
    }

    fn on_commit(&mut self, commit: Commit) -> Vec<Action> {
        let view = self.view();
        if commit.view != view || self.view_change.is_changing() {
            return Vec::new();
        }
        if !self.log.in_window(commit.seq) {
            return Vec::new();
        }
        let seq = commit.seq;
        self.log.slot_mut(seq).add_commit(commit);
        self.advance_slot(seq)
    }

    /// Drive a slot through phase transitions after new votes landed.
    fn advance_slot(&mut self, seq: SeqNum) -> Vec<Action> {
        let mut actions = Vec::new();
        let prepare_quorum = self.membership.prepare_quorum();
        let quorum = self.membership.quorum();
        let local = self.membership.local_id();
        let view = self.view();

        let slot = match self.log.slot(seq) {
            Some(slot) => slot,
            None => return actions,
        };

        if slot.is_prepared(prepare_quorum) && !slot.has_commit_from(local) {
            let digest = match slot.accepted_digest() {
                Some(digest) => digest,
                None => return actions,
            };
            debug!(seq = %seq, "prepared certificate reached, committing");
            let commit = Commit::signed(self.auth.key(), local, view, seq, digest);
            self.log.slot_mut(seq).add_commit(commit.clone());
            actions.push(Action::Broadcast {
                message: ConsensusMessage::Commit(commit),
            });
        }

        let slot = match self.log.slot(seq) {
            Some(slot) => slot,
            None => return actions,
        };
        if slot.is_committed(prepare_quorum, quorum) && !self.log.is_committed(seq) {
            let pp = match slot.pre_prepare() {
                Some(pp) => pp,
                None => return actions,
            };
            let entry = CommittedEntry {
                digest: pp.digest,
                request: pp.request.clone(),
            };
            info!(seq = %seq, digest = %entry.digest, "slot committed");
            self.log.record_committed(seq, entry);
            actions.extend(self.deliver_ready());
        }
        actions
    }

    /// Deliver every contiguously committed slot, in order, and fold
    /// each into the checkpoint chain.
    fn deliver_ready(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        let quorum = self.membership.quorum();
        while let Some((seq, entry)) = self.log.pop_deliverable() {
            actions.push(self.cancel_timer(TimerId::Request(seq)));
            if let Some(request) = entry.request.clone() {
                let digest = entry.digest;
                self.last_reply.insert(
                    request.client,
                    LastReply {
                        nonce: request.nonce,
                        seq,
                        digest,
                    },
                );
                self.backlog.retain(|r| r.digest() != digest);
                actions.push(self.cancel_timer(TimerId::ClientWait(digest)));
                if let Some(request_id) = self.pending.remove(&digest) {
                    actions.push(Action::NotifyCommitted {
                        request_id,
                        digest,
                        seq,
                    });
                }
                actions.push(Action::DeliverCommitted { seq, request });
            }
            self.view_change.note_progress();

            if let Some((boundary, state_digest)) = self.checkpoints.on_deliver(seq, entry.digest)
            {
                let attestation = Checkpoint::signed(
                    self.auth.key(),
                    self.membership.local_id(),
                    boundary,
                    state_digest,
                );
                actions.extend(self.record_checkpoint(attestation.clone(), quorum));
                actions.push(Action::Broadcast {
                    message: ConsensusMessage::Checkpoint(attestation),
                });
            }
        }
        actions
    }

    fn on_checkpoint(&mut self, checkpoint: Checkpoint) -> Vec<Action> {
        let quorum = self.membership.quorum();
        self.record_checkpoint(checkpoint, quorum)
    }

    fn record_checkpoint(&mut self, checkpoint: Checkpoint, quorum: usize) -> Vec<Action> {
        match self.checkpoints.on_checkpoint(checkpoint, quorum) {
            CheckpointOutcome::Pending => Vec::new(),
            CheckpointOutcome::Stable { seq, digest } => {
                info!(seq = %seq, digest = %digest, "checkpoint is stable");
                self.log.install_stable(seq);
                // Entries the prune retained may now be contiguously
                // deliverable.
                self.deliver_ready()
            }
            CheckpointOutcome::Divergence {
                seq,
                local,
                certified,
            } => self.halt(format!(
                "stable checkpoint divergence at {seq}: local {local}, certified {certified}"
            )),
        }
    }

    /// Unrecoverable safety violation: raise the alarm and stop.
    fn halt(&mut self, reason: String) -> Vec<Action> {
        error!(reason = %reason, "integrity alarm, halting");
        self.halted = true;
        vec![Action::RaiseIntegrityAlarm { reason }]
    }

    // ════════════════════════════════════════════════════════════════
    // Client submissions
    // ════════════════════════════════════════════════════════════════

    /// A client asked this replica to order a request.
    pub fn submit(&mut self, request: ClientRequest, request_id: RequestId) -> Vec<Action> {
        if self.halted {
            return vec![Action::NotifySubmitFailed {
                request_id,
                error: SubmitError::Halted,
            }];
        }

        let digest = request.digest();
        // Resubmission of an already-delivered request gets the cached
        // outcome instead of a second slot.
        if let Some(reply) = self.last_reply.get(&request.client) {
            if request.nonce <= reply.nonce {
                debug!(client = %request.client, nonce = request.nonce, "duplicate submission");
                return vec![Action::NotifyCommitted {
                    request_id,
                    digest: reply.digest,
                    seq: reply.seq,
                }];
            }
        }

        if let ViewStatus::ViewChanging { target } = self.view_change.status() {
            return vec![Action::NotifySubmitFailed {
                request_id,
                error: SubmitError::ViewChangeInProgress { target },
            }];
        }

        let view = self.view();
        if !self.membership.is_primary(view) {
            // Not ours to order, but hold onto it: if the real primary
            // never orders it we have grounds to suspect, and after a
            // view change we may become responsible for it.
            let mut actions = vec![Action::NotifySubmitFailed {
                request_id,
                error: SubmitError::NotPrimary {
                    local: self.membership.local_id(),
                    view,
                    primary: self.membership.primary(view),
                },
            }];
            if !self.backlog.iter().any(|r| r.digest() == digest) {
                self.backlog.push(request);
                actions.push(
                    self.set_timer(TimerId::ClientWait(digest), self.config.request_timeout),
                );
            }
            return actions;
        }

        let seq = match self.log.assign_next_seq() {
            Some(seq) => seq,
            None => {
                return vec![Action::NotifySubmitFailed {
                    request_id,
                    error: SubmitError::WindowExhausted {
                        low: self.log.low(),
                        high: self.log.high(),
                    },
                }];
            }
        };

        info!(seq = %seq, digest = %digest, "proposing request");
        self.pending.insert(digest, request_id);
        let pp = PrePrepare::signed(
            self.auth.key(),
            self.membership.local_id(),
            view,
            seq,
            request,
        );
        self.log.slot_mut(seq).set_pre_prepare(pp.clone());
        vec![
            Action::Broadcast {
                message: ConsensusMessage::PrePrepare(pp),
            },
            self.set_timer(TimerId::Request(seq), self.config.request_timeout),
        ]
    }

    // ════════════════════════════════════════════════════════════════
    // Timers
    // ════════════════════════════════════════════════════════════════

    /// A slot sat too long without committing.
    pub fn on_request_timer(&mut self, seq: SeqNum) -> Vec<Action> {
        // A firing we already cancelled (view installation, delivery)
        // carries no suspicion.
        if !self.armed.remove(&TimerId::Request(seq)) {
            return Vec::new();
        }
        if self.halted || self.view_change.is_changing() {
            return Vec::new();
        }
        if self.log.is_committed(seq) {
            return Vec::new();
        }
        warn!(seq = %seq, view = %self.view(), "slot stalled, suspecting primary");
        self.suspect_primary()
    }

    /// A request we took responsibility for was never delivered.
    pub fn on_client_wait_timer(&mut self, digest: Hash) -> Vec<Action> {
        if !self.armed.remove(&TimerId::ClientWait(digest)) {
            return Vec::new();
        }
        if self.halted || self.view_change.is_changing() {
            return Vec::new();
        }
        if !self.backlog.iter().any(|r| r.digest() == digest) {
            return Vec::new();
        }
        warn!(digest = %digest, view = %self.view(), "held request stalled, suspecting primary");
        self.suspect_primary()
    }

    /// The in-progress view change itself timed out; escalate.
    pub fn on_view_change_timer(&mut self) -> Vec<Action> {
        if !self.armed.remove(&TimerId::ViewChange) {
            return Vec::new();
        }
        if self.halted || !self.view_change.is_changing() {
            return Vec::new();
        }
        let target = self.view_change.escalate();
        warn!(target = %target, "view change timed out, escalating");
        self.vote_for_view(target)
    }

    // ════════════════════════════════════════════════════════════════
    // View changes
    // ════════════════════════════════════════════════════════════════

    /// Stop trusting the current primary: vote for the next view.
    fn suspect_primary(&mut self) -> Vec<Action> {
        let target = self.view().next();
        self.view_change.begin(target);
        self.vote_for_view(target)
    }

    /// Broadcast our own view-change vote for `target` and arm the
    /// escalation timer.
    fn vote_for_view(&mut self, target: View) -> Vec<Action> {
        let (stable, stable_proof) = {
            let (seq, digest) = self.checkpoints.stable();
            ((seq, digest), self.checkpoints.stable_proof().to_vec())
        };
        let prepared = self.log.prepared_proofs(self.membership.prepare_quorum());
        let vote = ViewChange::signed(
            self.auth.key(),
            self.membership.local_id(),
            target,
            stable,
            stable_proof,
            prepared,
        );
        self.view_change.record_vote(vote.clone());

        let timeout = self.view_change.timeout(self.config.view_change_timeout);
        let mut actions = vec![
            Action::Broadcast {
                message: ConsensusMessage::ViewChange(vote),
            },
            self.set_timer(TimerId::ViewChange, timeout),
        ];
        actions.extend(self.try_lead_view(target));
        actions
    }

    fn on_view_change(&mut self, vote: ViewChange) -> Vec<Action> {
        if !validate_view_change_evidence(
            &vote,
            &self.auth,
            self.membership.quorum(),
            self.membership.prepare_quorum(),
        ) {
            warn!(sender = %vote.replica, target = %vote.new_view, "vote with invalid evidence");
            return Vec::new();
        }
        let target = vote.new_view;
        self.view_change.record_vote(vote);

        let mut actions = Vec::new();
        // Join rule: f+1 distinct replicas ahead of us means at least
        // one honest replica gave up on this view; follow the smallest.
        if let Some(candidate) = self.view_change.join_candidate(self.membership.faults()) {
            info!(candidate = %candidate, "joining view change");
            self.view_change.begin(candidate);
            actions.extend(self.vote_for_view(candidate));
        }
        actions.extend(self.try_lead_view(target));
        actions
    }

    /// If we are the primary of `target` and hold a vote quorum,
    /// announce the new view and install it.
    fn try_lead_view(&mut self, target: View) -> Vec<Action> {
        if target <= self.view()
            || self.membership.primary(target) != self.membership.local_id()
            || self.view_change.votes_for(target) < self.membership.quorum()
        {
            return Vec::new();
        }
        let votes = self.view_change.quorum_votes(target);
        let new_view = build_new_view(
            self.auth.key(),
            self.membership.local_id(),
            target,
            votes,
        );
        info!(view = %target, proposals = new_view.pre_prepares.len(), "announcing new view");

        let stable = {
            let mut best = (SeqNum::ZERO, Hash::ZERO);
            let mut proof = Vec::new();
            for vote in &new_view.view_changes {
                if vote.last_stable.0 > best.0 {
                    best = vote.last_stable;
                    proof = vote.checkpoint_proof.clone();
                }
            }
            (best, proof)
        };

        let mut actions = vec![Action::Broadcast {
            message: ConsensusMessage::NewView(new_view.clone()),
        }];
        actions.extend(self.install_view(&new_view, stable.0, stable.1));
        actions
    }

    fn on_new_view(&mut self, new_view: NewView) -> Vec<Action> {
        if new_view.view <= self.view() {
            return Vec::new();
        }
        let expected = self.membership.primary(new_view.view);
        let validated = match validate_new_view(
            &new_view,
            &self.auth,
            expected,
            self.membership.quorum(),
            self.membership.prepare_quorum(),
        ) {
            Ok(validated) => validated,
            Err(err) => {
                warn!(view = %new_view.view, error = %err, "rejecting new-view announcement");
                return Vec::new();
            }
        };
        self.install_view(&new_view, validated.stable, validated.stable_proof)
    }

    /// Adopt a view: reset in-flight state, seed the re-proposals, and
    /// resume normal operation.
    fn install_view(
        &mut self,
        new_view: &NewView,
        stable: (SeqNum, Hash),
        stable_proof: Vec<Checkpoint>,
    ) -> Vec<Action> {
        let view = new_view.view;
        self.checkpoints.install_stable(stable.0, stable.1, stable_proof);
        self.log.install_stable(stable.0);
        // Votes from the abandoned view must not count toward the new
        // one.
        self.log.clear_in_flight();
        self.view_change.install(view);

        // Every timer armed so far belongs to the abandoned view. A
        // stale slot timer firing after the switch would indict the new
        // primary for the old one's failure.
        let stale: Vec<TimerId> = self.armed.iter().copied().collect();
        let mut actions: Vec<Action> = stale
            .into_iter()
            .map(|id| self.cancel_timer(id))
            .collect();

        let is_primary = self.membership.is_primary(view);
        let mut max_seq = self.log.stable();
        for pp in &new_view.pre_prepares {
            if pp.seq > max_seq {
                max_seq = pp.seq;
            }
            if pp.seq <= self.log.stable() || self.log.is_committed(pp.seq) {
                continue;
            }
            if !self.log.in_window(pp.seq) {
                continue;
            }
            let seq = pp.seq;
            let digest = pp.digest;
            self.log.slot_mut(seq).set_pre_prepare(pp.clone());
            actions.push(self.set_timer(TimerId::Request(seq), self.config.request_timeout));
            if !is_primary {
                let prepare = Prepare::signed(
                    self.auth.key(),
                    self.membership.local_id(),
                    view,
                    seq,
                    digest,
                );
                self.log.slot_mut(seq).add_prepare(prepare.clone());
                actions.push(Action::Broadcast {
                    message: ConsensusMessage::Prepare(prepare),
                });
            }
        }
        info!(view = %view, stable = %stable.0, reproposals = new_view.pre_prepares.len(), "view installed");

        if is_primary {
            self.log.bump_next_seq(max_seq.next());
            // Re-propose everything we are holding for clients.
            let backlog: Vec<ClientRequest> = self.backlog.clone();
            for request in backlog {
                let already_proposed = new_view
                    .pre_prepares
                    .iter()
                    .any(|pp| pp.digest == request.digest());
                if already_proposed {
                    continue;
                }
                let seq = match self.log.assign_next_seq() {
                    Some(seq) => seq,
                    None => break,
                };
                info!(seq = %seq, digest = %request.digest(), "re-proposing held request");
                let pp = PrePrepare::signed(
                    self.auth.key(),
                    self.membership.local_id(),
                    view,
                    seq,
                    request,
                );
                self.log.slot_mut(seq).set_pre_prepare(pp.clone());
                actions.push(Action::Broadcast {
                    message: ConsensusMessage::PrePrepare(pp),
                });
                actions.push(self.set_timer(TimerId::Request(seq), self.config.request_timeout));
            }
        } else {
            // Still a backup: restart the hold timers for requests we
            // are keeping, measured against the new primary.
            let digests: Vec<Hash> = self.backlog.iter().map(|r| r.digest()).collect();
            for digest in digests {
                actions.push(
                    self.set_timer(TimerId::ClientWait(digest), self.config.request_timeout),
                );
            }
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    const QUORUM_KEYS: u8 = 4;

    fn keys() -> Vec<KeyPair> {
        (0..QUORUM_KEYS).map(|i| KeyPair::from_seed(&[i + 1; 32])).collect()
    }

    fn replica(local: u64) -> ReplicaState {
        replica_with_config(local, ConsensusConfig::default())
    }

    fn replica_with_config(local: u64, config: ConsensusConfig) -> ReplicaState {
        let keys = keys();
        let membership = Arc::new(
            Membership::new(
                pbft_types::ReplicaId(local),
                keys.iter().map(|k| k.public_key()).collect(),
                1,
            )
            .unwrap(),
        );
        ReplicaState::new(keys[local as usize].clone(), membership, config)
    }

    fn request(nonce: u64) -> ClientRequest {
        ClientRequest::new(ClientId(1), nonce, format!("op-{nonce}").into_bytes())
    }

    fn broadcasts(actions: &[Action]) -> Vec<&ConsensusMessage> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Broadcast { message } => Some(message),
                _ => None,
            })
            .collect()
    }

    /// Drive one request to commitment on `state` (a backup at
    /// replica-1, view 0) using messages signed by the other replicas.
    fn commit_one(state: &mut ReplicaState, seq: SeqNum, req: &ClientRequest) -> Vec<Action> {
        let keys = keys();
        let primary = pbft_types::ReplicaId(0);
        let pp = PrePrepare::signed(&keys[0], primary, View(0), seq, req.clone());
        let mut actions = state.on_verified(ConsensusMessage::PrePrepare(pp), true);
        for r in [2u64, 3] {
            let prepare = Prepare::signed(
                &keys[r as usize],
                pbft_types::ReplicaId(r),
                View(0),
                seq,
                req.digest(),
            );
            actions.extend(state.on_verified(ConsensusMessage::Prepare(prepare), true));
        }
        for r in [0u64, 2, 3] {
            let commit = Commit::signed(
                &keys[r as usize],
                pbft_types::ReplicaId(r),
                View(0),
                seq,
                req.digest(),
            );
            actions.extend(state.on_verified(ConsensusMessage::Commit(commit), true));
        }
        actions
    }

    #[test]
    #[traced_test]
    fn test_primary_proposes_on_submit() {
        let mut primary = replica(0);
        let actions = primary.submit(request(1), RequestId(1));

        let sent = broadcasts(&actions);
        assert_eq!(sent.len(), 1);
        match sent[0] {
            ConsensusMessage::PrePrepare(pp) => {
                assert_eq!(pp.seq, SeqNum(1));
                assert_eq!(pp.view, View(0));
            }
            other => panic!("expected PrePrepare, got {}", other.type_name()),
        }
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::SetTimer { id: TimerId::Request(s), .. } if *s == SeqNum(1))));
    }

    #[test]
    #[traced_test]
    fn test_backup_rejects_and_backlogs_submission() {
        let mut backup = replica(1);
        let actions = backup.submit(request(1), RequestId(1));

        assert!(actions.iter().any(|a| matches!(
            a,
            Action::NotifySubmitFailed {
                error: SubmitError::NotPrimary { .. },
                ..
            }
        )));
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::SetTimer { id: TimerId::ClientWait(_), .. })));
    }

    #[test]
    #[traced_test]
    fn test_backup_prepares_on_proposal() {
        let keys = keys();
        let mut backup = replica(1);
        let req = request(1);
        let pp = PrePrepare::signed(&keys[0], pbft_types::ReplicaId(0), View(0), SeqNum(1), req);

        let actions = backup.on_verified(ConsensusMessage::PrePrepare(pp), true);
        let sent = broadcasts(&actions);
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], ConsensusMessage::Prepare(_)));
    }

    #[test]
    #[traced_test]
    fn test_proposal_from_non_primary_ignored() {
        let keys = keys();
        let mut backup = replica(1);
        let pp = PrePrepare::signed(
            &keys[2],
            pbft_types::ReplicaId(2),
            View(0),
            SeqNum(1),
            request(1),
        );
        assert!(backup
            .on_verified(ConsensusMessage::PrePrepare(pp), true)
            .is_empty());
    }

    #[test]
    #[traced_test]
    fn test_full_commit_delivers_in_order() {
        let mut backup = replica(1);
        let req = request(1);
        let actions = commit_one(&mut backup, SeqNum(1), &req);

        let delivered: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                Action::DeliverCommitted { seq, request } => Some((*seq, request.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, vec![(SeqNum(1), req)]);
        assert_eq!(backup.delivered(), SeqNum(1));
    }

    #[test]
    #[traced_test]
    fn test_delivery_waits_for_gap() {
        let mut backup = replica(1);
        // Commit seq 2 first: it must sit until seq 1 commits.
        let req2 = request(2);
        let actions = commit_one(&mut backup, SeqNum(2), &req2);
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::DeliverCommitted { .. })));

        let req1 = request(1);
        let actions = commit_one(&mut backup, SeqNum(1), &req1);
        let delivered: Vec<SeqNum> = actions
            .iter()
            .filter_map(|a| match a {
                Action::DeliverCommitted { seq, .. } => Some(*seq),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, vec![SeqNum(1), SeqNum(2)]);
    }

    #[test]
    #[traced_test]
    fn test_duplicate_submission_returns_cached_reply() {
        let mut backup = replica(1);
        let req = request(1);
        commit_one(&mut backup, SeqNum(1), &req);

        let actions = backup.submit(req.clone(), RequestId(9));
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            Action::NotifyCommitted {
                request_id,
                digest,
                seq,
            } => {
                assert_eq!(*request_id, RequestId(9));
                assert_eq!(*digest, req.digest());
                assert_eq!(*seq, SeqNum(1));
            }
            other => panic!("expected NotifyCommitted, got {}", other.type_name()),
        }
    }

    #[test]
    #[traced_test]
    fn test_equivocation_triggers_view_change() {
        let keys = keys();
        let mut backup = replica(1);

        let a = PrePrepare::signed(
            &keys[0],
            pbft_types::ReplicaId(0),
            View(0),
            SeqNum(1),
            request(1),
        );
        let b = PrePrepare::signed(
            &keys[0],
            pbft_types::ReplicaId(0),
            View(0),
            SeqNum(1),
            request(2),
        );
        backup.on_verified(ConsensusMessage::PrePrepare(a), true);
        let actions = backup.on_verified(ConsensusMessage::PrePrepare(b), true);

        let sent = broadcasts(&actions);
        assert!(sent
            .iter()
            .any(|m| matches!(m, ConsensusMessage::ViewChange(vc) if vc.new_view == View(1))));
    }

    #[test]
    #[traced_test]
    fn test_request_timer_starts_view_change() {
        let keys = keys();
        let mut backup = replica(1);
        let pp = PrePrepare::signed(
            &keys[0],
            pbft_types::ReplicaId(0),
            View(0),
            SeqNum(1),
            request(1),
        );
        backup.on_verified(ConsensusMessage::PrePrepare(pp), true);

        let actions = backup.on_request_timer(SeqNum(1));
        let sent = broadcasts(&actions);
        assert!(sent
            .iter()
            .any(|m| matches!(m, ConsensusMessage::ViewChange(vc) if vc.new_view == View(1))));
        // Ordering is paused while changing.
        let rejected = backup.submit(request(5), RequestId(5));
        assert!(rejected.iter().any(|a| matches!(
            a,
            Action::NotifySubmitFailed {
                error: SubmitError::ViewChangeInProgress { .. },
                ..
            }
        )));
    }

    #[test]
    #[traced_test]
    fn test_view_change_quorum_installs_new_view() {
        let keys = keys();
        // replica-1 is the primary of view 1. Stall a slot so its
        // request timer has grounds to suspect.
        let mut next_primary = replica(1);
        let pp = PrePrepare::signed(
            &keys[0],
            pbft_types::ReplicaId(0),
            View(0),
            SeqNum(1),
            request(1),
        );
        next_primary.on_verified(ConsensusMessage::PrePrepare(pp), true);
        next_primary.on_request_timer(SeqNum(1));

        let mut actions = Vec::new();
        for r in [2u64, 3] {
            let vote = ViewChange::signed(
                &keys[r as usize],
                pbft_types::ReplicaId(r),
                View(1),
                (SeqNum::ZERO, Hash::ZERO),
                Vec::new(),
                Vec::new(),
            );
            actions.extend(next_primary.on_verified(ConsensusMessage::ViewChange(vote), true));
        }

        let sent = broadcasts(&actions);
        assert!(sent.iter().any(|m| matches!(m, ConsensusMessage::NewView(_))));
        assert_eq!(next_primary.view(), View(1));
    }

    #[test]
    #[traced_test]
    fn test_join_rule_follows_f_plus_one() {
        let keys = keys();
        let mut backup = replica(3);

        let mut actions = Vec::new();
        for r in [1u64, 2] {
            let vote = ViewChange::signed(
                &keys[r as usize],
                pbft_types::ReplicaId(r),
                View(1),
                (SeqNum::ZERO, Hash::ZERO),
                Vec::new(),
                Vec::new(),
            );
            actions.extend(backup.on_verified(ConsensusMessage::ViewChange(vote), true));
        }

        let sent = broadcasts(&actions);
        assert!(sent
            .iter()
            .any(|m| matches!(m, ConsensusMessage::ViewChange(vc) if vc.new_view == View(1))));
    }

    #[test]
    #[traced_test]
    fn test_stale_messages_ignored() {
        let keys = keys();
        let mut backup = replica(1);
        // Force the replica into view 1 via a quorum of votes plus the
        // new-view announcement path (it is the new primary itself).
        let pp = PrePrepare::signed(
            &keys[0],
            pbft_types::ReplicaId(0),
            View(0),
            SeqNum(1),
            request(1),
        );
        backup.on_verified(ConsensusMessage::PrePrepare(pp), true);
        backup.on_request_timer(SeqNum(1));
        for r in [2u64, 3] {
            let vote = ViewChange::signed(
                &keys[r as usize],
                pbft_types::ReplicaId(r),
                View(1),
                (SeqNum::ZERO, Hash::ZERO),
                Vec::new(),
                Vec::new(),
            );
            backup.on_verified(ConsensusMessage::ViewChange(vote), true);
        }
        assert_eq!(backup.view(), View(1));

        // Old-view traffic is now stale.
        let stale = Prepare::signed(
            &keys[2],
            pbft_types::ReplicaId(2),
            View(0),
            SeqNum(1),
            request(1).digest(),
        );
        assert!(backup
            .on_verified(ConsensusMessage::Prepare(stale), true)
            .is_empty());
    }

    #[test]
    #[traced_test]
    fn test_checkpoint_divergence_halts() {
        let keys = keys();
        let mut backup = replica_with_config(
            1,
            ConsensusConfig {
                checkpoint_interval: 1,
                ..ConsensusConfig::default()
            },
        );
        let req = request(1);
        commit_one(&mut backup, SeqNum(1), &req);

        // A quorum certifies a different history at our boundary.
        let forged = Hash::from_bytes(b"forged state");
        let mut actions = Vec::new();
        for r in [0u64, 2, 3] {
            let cp = Checkpoint::signed(
                &keys[r as usize],
                pbft_types::ReplicaId(r),
                SeqNum(1),
                forged,
            );
            actions.extend(backup.on_verified(ConsensusMessage::Checkpoint(cp), true));
        }

        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::RaiseIntegrityAlarm { .. })));
        assert!(backup.is_halted());
        assert!(backup.submit(request(9), RequestId(9)).iter().any(|a| matches!(
            a,
            Action::NotifySubmitFailed {
                error: SubmitError::Halted,
                ..
            }
        )));
    }

    #[test]
    #[traced_test]
    fn test_window_exhaustion() {
        let mut primary = replica_with_config(
            0,
            ConsensusConfig {
                window_size: 2,
                ..ConsensusConfig::default()
            },
        );
        primary.submit(request(1), RequestId(1));
        primary.submit(request(2), RequestId(2));
        let actions = primary.submit(request(3), RequestId(3));

        assert!(actions.iter().any(|a| matches!(
            a,
            Action::NotifySubmitFailed {
                error: SubmitError::WindowExhausted { .. },
                ..
            }
        )));
    }

    #[test]
    #[traced_test]
    fn test_checkpoint_quorum_advances_watermarks() {
        let keys = keys();
        let mut backup = replica_with_config(
            1,
            ConsensusConfig {
                checkpoint_interval: 1,
                window_size: 2,
                ..ConsensusConfig::default()
            },
        );
        let req = request(1);
        let actions = commit_one(&mut backup, SeqNum(1), &req);
        // Our own attestation went out at the boundary.
        assert!(broadcasts(&actions)
            .iter()
            .any(|m| matches!(m, ConsensusMessage::Checkpoint(_))));

        let own_digest = match broadcasts(&actions)
            .iter()
            .find_map(|m| match m {
                ConsensusMessage::Checkpoint(cp) => Some(cp.state_digest),
                _ => None,
            }) {
            Some(d) => d,
            None => unreachable!(),
        };
        for r in [0u64, 2] {
            let cp = Checkpoint::signed(
                &keys[r as usize],
                pbft_types::ReplicaId(r),
                SeqNum(1),
                own_digest,
            );
            backup.on_verified(ConsensusMessage::Checkpoint(cp), true);
        }

        assert_eq!(backup.stable().0, SeqNum(1));
    }

    #[test]
    #[traced_test]
    fn test_adopted_checkpoint_does_not_skip_delivery() {
        let keys = keys();
        let mut backup = replica_with_config(
            1,
            ConsensusConfig {
                checkpoint_interval: 2,
                ..ConsensusConfig::default()
            },
        );
        commit_one(&mut backup, SeqNum(1), &request(1));
        assert_eq!(backup.delivered(), SeqNum(1));

        // A quorum certifies the seq-2 boundary we never delivered.
        let certified = Hash::from_bytes(b"state at seq 2");
        for r in [0u64, 2, 3] {
            let cp = Checkpoint::signed(
                &keys[r as usize],
                pbft_types::ReplicaId(r),
                SeqNum(2),
                certified,
            );
            backup.on_verified(ConsensusMessage::Checkpoint(cp), true);
        }
        assert_eq!(backup.stable().0, SeqNum(2));
        assert!(!backup.is_halted());

        // Seq 3 commits, but the application stream must stall at the
        // seq-2 hole instead of jumping over it.
        let actions = commit_one(&mut backup, SeqNum(3), &request(3));
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::DeliverCommitted { .. })));
        assert_eq!(backup.delivered(), SeqNum(1));
    }

    #[test]
    #[traced_test]
    fn test_view_install_cancels_stale_slot_timers() {
        let keys = keys();
        // replica-2 stays a backup across the change to view 1.
        let mut backup = replica(2);
        let pp = PrePrepare::signed(
            &keys[0],
            pbft_types::ReplicaId(0),
            View(0),
            SeqNum(1),
            request(1),
        );
        backup.on_verified(ConsensusMessage::PrePrepare(pp), true);

        let votes: Vec<ViewChange> = [0u64, 1, 3]
            .iter()
            .map(|&r| {
                ViewChange::signed(
                    &keys[r as usize],
                    pbft_types::ReplicaId(r),
                    View(1),
                    (SeqNum::ZERO, Hash::ZERO),
                    Vec::new(),
                    Vec::new(),
                )
            })
            .collect();
        let new_view = NewView::signed(&keys[1], pbft_types::ReplicaId(1), View(1), votes, Vec::new());
        let actions = backup.on_verified(ConsensusMessage::NewView(new_view), true);
        assert_eq!(backup.view(), View(1));

        // The slot timer from view 0 must be cancelled on install; the
        // new view carries no re-proposal for it.
        assert!(actions.iter().any(|a| matches!(
            a,
            Action::CancelTimer { id: TimerId::Request(s) } if *s == SeqNum(1)
        )));

        // Even if the runner races the cancellation, a late firing must
        // not indict the new primary.
        let fired = backup.on_request_timer(SeqNum(1));
        assert!(fired.is_empty());
        assert_eq!(backup.view(), View(1));
    }
}
