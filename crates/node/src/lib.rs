//! The replica node: a [`StateMachine`] over the consensus engine.
//!
//! The node is a thin router. It owns the engine and a clock, maps each
//! event to the matching engine handler, and passes the resulting
//! actions straight back to the runner.

use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use pbft_consensus::{ConsensusConfig, ReplicaState};
use pbft_core::{Action, Event, StateMachine};
use pbft_types::{KeyPair, Membership, ReplicaId};

/// One replica as a deterministic state machine.
pub struct NodeStateMachine {
    id: ReplicaId,
    replica: ReplicaState,
    now: Duration,
}

impl NodeStateMachine {
    /// Create a node for the local member of `membership`.
    pub fn new(key: KeyPair, membership: Arc<Membership>, config: ConsensusConfig) -> Self {
        let id = membership.local_id();
        Self {
            id,
            replica: ReplicaState::new(key, membership, config),
            now: Duration::ZERO,
        }
    }

    /// This node's replica id.
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// The consensus engine, for inspection.
    pub fn replica(&self) -> &ReplicaState {
        &self.replica
    }

    /// The consensus engine, mutable.
    pub fn replica_mut(&mut self) -> &mut ReplicaState {
        &mut self.replica
    }
}

impl StateMachine for NodeStateMachine {
    fn handle(&mut self, event: Event) -> Vec<Action> {
        trace!(node = %self.id, event = event.type_name(), "handling event");
        match event {
            Event::MessageReceived { message } => self.replica.on_message(message),
            Event::MessageVerified { message, valid } => self.replica.on_verified(message, valid),
            Event::SubmitRequest {
                request,
                request_id,
            } => self.replica.submit(request, request_id),
            Event::RequestTimer { seq } => self.replica.on_request_timer(seq),
            Event::ClientWaitTimer { digest } => self.replica.on_client_wait_timer(digest),
            Event::ViewChangeTimer => self.replica.on_view_change_timer(),
        }
    }

    fn set_time(&mut self, now: Duration) {
        self.now = now;
    }

    fn now(&self) -> Duration {
        self.now
    }
}
