//! The deterministic simulation runner.
//!
//! Owns a set of replica nodes, a virtual clock, a seeded RNG, and a
//! totally ordered event queue. Executes every action the nodes emit:
//! message delivery through the simulated network, timers, instant
//! signature verification, and delivery/notification recording.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, trace};

use pbft_consensus::ConsensusConfig;
use pbft_core::{Action, Event, RequestId, StateMachine, SubmitError, TimerId};
use pbft_node::NodeStateMachine;
use pbft_types::{ClientRequest, ConsensusMessage, Hash, KeyPair, Membership, ReplicaId, SeqNum};

use crate::event_queue::EventKey;
use crate::network::{NetworkConfig, SimulatedNetwork};

/// Everything one node reported to the outside world during a run.
#[derive(Debug, Default, Clone)]
pub struct NodeObservations {
    /// Requests delivered to the application, in delivery order.
    pub delivered: Vec<(SeqNum, ClientRequest)>,
    /// Commit notifications for locally submitted requests.
    pub committed: Vec<(RequestId, Hash, SeqNum)>,
    /// Rejected submissions.
    pub submit_failures: Vec<(RequestId, SubmitError)>,
    /// Integrity alarms.
    pub alarms: Vec<String>,
}

/// A deterministic multi-replica simulation.
pub struct SimulationRunner {
    nodes: Vec<NodeStateMachine>,
    /// Replica signing keys, kept so tests can forge traffic from a
    /// Byzantine node.
    keys: Vec<KeyPair>,
    network: SimulatedNetwork,
    rng: ChaCha8Rng,
    queue: BTreeMap<EventKey, Event>,
    /// Armed timers per node, mapping each timer to its queue entry so
    /// cancellation and re-arming can remove it.
    timers: Vec<BTreeMap<TimerId, EventKey>>,
    crashed: BTreeSet<usize>,
    observations: Vec<NodeObservations>,
    now: Duration,
    next_queue_seq: u64,
    next_request_id: u64,
}

impl SimulationRunner {
    /// Create `3 * faults + 1` replicas with deterministic seeded keys.
    pub fn new(
        faults: usize,
        seed: u64,
        config: ConsensusConfig,
        network_config: NetworkConfig,
    ) -> Self {
        let num_nodes = 3 * faults + 1;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let keys: Vec<KeyPair> = (0..num_nodes)
            .map(|_| {
                let mut key_seed = [0u8; 32];
                rng.fill(&mut key_seed);
                KeyPair::from_seed(&key_seed)
            })
            .collect();
        let public_keys: Vec<_> = keys.iter().map(|k| k.public_key()).collect();

        let nodes = keys
            .iter()
            .enumerate()
            .map(|(i, key)| {
                let membership = Arc::new(
                    Membership::new(ReplicaId(i as u64), public_keys.clone(), faults)
                        .expect("simulation membership is always well formed"),
                );
                NodeStateMachine::new(key.clone(), membership, config.clone())
            })
            .collect();

        Self {
            nodes,
            keys,
            network: SimulatedNetwork::new(network_config),
            rng,
            queue: BTreeMap::new(),
            timers: vec![BTreeMap::new(); num_nodes],
            crashed: BTreeSet::new(),
            observations: vec![NodeObservations::default(); num_nodes],
            now: Duration::ZERO,
            next_queue_seq: 0,
            next_request_id: 0,
        }
    }

    /// Number of replicas.
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Current virtual time.
    pub fn now(&self) -> Duration {
        self.now
    }

    /// One node's state machine, for inspection.
    pub fn node(&self, index: usize) -> &NodeStateMachine {
        &self.nodes[index]
    }

    /// What a node reported during the run so far.
    pub fn observations(&self, index: usize) -> &NodeObservations {
        &self.observations[index]
    }

    /// The simulated network, for fault injection.
    pub fn network_mut(&mut self) -> &mut SimulatedNetwork {
        &mut self.network
    }

    /// One node's signing key, for forging Byzantine traffic in tests.
    pub fn node_key(&self, index: usize) -> &KeyPair {
        &self.keys[index]
    }

    /// Deliver a hand-built message to one node, bypassing the
    /// broadcast path. Latency is sampled like any other message.
    pub fn inject(&mut self, to: usize, message: ConsensusMessage) {
        let latency = self.network.sample_latency(&mut self.rng);
        self.schedule(to, self.now + latency, Event::MessageReceived { message });
    }

    /// Stop a node: its queued events are discarded and it emits
    /// nothing further.
    pub fn crash(&mut self, index: usize) {
        debug!(node = index, "crashing node");
        self.crashed.insert(index);
    }

    /// Submit a request to one node, returning the submission handle.
    pub fn submit(&mut self, index: usize, request: ClientRequest) -> RequestId {
        let request_id = RequestId(self.next_request_id);
        self.next_request_id += 1;
        let event = Event::SubmitRequest {
            request,
            request_id,
        };
        self.schedule(index, self.now, event);
        request_id
    }

    /// Run the simulation until the virtual clock reaches `deadline`.
    pub fn run_until(&mut self, deadline: Duration) {
        while let Some((&key, _)) = self.queue.iter().next() {
            if key.time > deadline {
                break;
            }
            let event = match self.queue.remove(&key) {
                Some(event) => event,
                None => continue,
            };
            self.now = key.time.max(self.now);

            if self.crashed.contains(&key.node) {
                continue;
            }
            // A timer event only counts if the timer is still armed
            // under this exact queue entry.
            if let Some(timer_id) = event.timer_id() {
                match self.timers[key.node].get(&timer_id) {
                    Some(&armed) if armed == key => {
                        self.timers[key.node].remove(&timer_id);
                    }
                    _ => continue,
                }
            }

            trace!(node = key.node, event = event.type_name(), at = ?key.time, "dispatching");
            self.nodes[key.node].set_time(self.now);
            let actions = self.nodes[key.node].handle(event);
            self.process_actions(key.node, actions);
        }
        self.now = deadline.max(self.now);
    }

    /// Run the simulation for `duration` more virtual time.
    pub fn run_for(&mut self, duration: Duration) {
        self.run_until(self.now + duration);
    }

    fn schedule(&mut self, node: usize, time: Duration, event: Event) -> EventKey {
        let key = EventKey {
            time,
            priority: event.priority(),
            node,
            seq: self.next_queue_seq,
        };
        self.next_queue_seq += 1;
        self.queue.insert(key, event);
        key
    }

    fn process_actions(&mut self, node: usize, actions: Vec<Action>) {
        for action in actions {
            trace!(node, action = action.type_name(), "executing action");
            match action {
                Action::Broadcast { message } => {
                    for dest in 0..self.nodes.len() {
                        if dest == node || self.crashed.contains(&dest) {
                            continue;
                        }
                        if !self.network.should_deliver(node, dest, &mut self.rng) {
                            continue;
                        }
                        let mut copies = 1;
                        if self.network.should_duplicate(&mut self.rng) {
                            copies += 1;
                        }
                        for _ in 0..copies {
                            let latency = self.network.sample_latency(&mut self.rng);
                            self.schedule(
                                dest,
                                self.now + latency,
                                Event::MessageReceived {
                                    message: message.clone(),
                                },
                            );
                        }
                    }
                }
                Action::SetTimer { id, duration } => {
                    // Re-arming replaces the previous deadline.
                    if let Some(old) = self.timers[node].remove(&id) {
                        self.queue.remove(&old);
                    }
                    let event = timer_event(id);
                    let key = self.schedule(node, self.now + duration, event);
                    self.timers[node].insert(id, key);
                }
                Action::CancelTimer { id } => {
                    if let Some(key) = self.timers[node].remove(&id) {
                        self.queue.remove(&key);
                    }
                }
                Action::VerifyMessage {
                    message,
                    public_key,
                    signing_message,
                } => {
                    // Verification is instant in simulation; the answer
                    // is queued at internal priority so it runs before
                    // any later traffic.
                    let valid = public_key.verify(&signing_message, message.signature());
                    self.schedule(node, self.now, Event::MessageVerified { message, valid });
                }
                Action::DeliverCommitted { seq, request } => {
                    self.observations[node].delivered.push((seq, request));
                }
                Action::NotifyCommitted {
                    request_id,
                    digest,
                    seq,
                } => {
                    self.observations[node]
                        .committed
                        .push((request_id, digest, seq));
                }
                Action::NotifySubmitFailed { request_id, error } => {
                    self.observations[node]
                        .submit_failures
                        .push((request_id, error));
                }
                Action::RaiseIntegrityAlarm { reason } => {
                    self.observations[node].alarms.push(reason);
                }
            }
        }
    }
}

fn timer_event(id: TimerId) -> Event {
    match id {
        TimerId::Request(seq) => Event::RequestTimer { seq },
        TimerId::ClientWait(digest) => Event::ClientWaitTimer { digest },
        TimerId::ViewChange => Event::ViewChangeTimer,
    }
}
