//! Events: everything that can happen to a replica.
//!
//! The engine is a deterministic state machine; events are its only
//! inputs. The runner (production or simulation) feeds them in one at a
//! time.

use crate::{RequestId, TimerId};
use pbft_types::{ClientRequest, ConsensusMessage, Hash, SeqNum};

/// Priority classes for event processing, lower value first.
///
/// Internal follow-ups run before timers, timers before network traffic,
/// and client submissions last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventPriority {
    /// Internally generated follow-up work.
    Internal = 0,
    /// Timer expirations.
    Timer = 1,
    /// Messages from other replicas.
    Network = 2,
    /// Client submissions.
    Client = 3,
}

/// An input to the replica state machine.
#[derive(Debug, Clone)]
pub enum Event {
    /// A message arrived from the network, not yet authenticated.
    MessageReceived {
        /// The raw message.
        message: ConsensusMessage,
    },

    /// Signature verification for a message completed.
    MessageVerified {
        /// The message that was checked.
        message: ConsensusMessage,
        /// Whether the signature was valid.
        valid: bool,
    },

    /// A client submitted a request for ordering.
    SubmitRequest {
        /// The request to order.
        request: ClientRequest,
        /// Caller-chosen handle for completion notifications.
        request_id: RequestId,
    },

    /// A per-slot progress timer expired.
    RequestTimer {
        /// The slot being watched.
        seq: SeqNum,
    },

    /// A client-wait timer expired: a request we accepted responsibility
    /// for has not been delivered in time.
    ClientWaitTimer {
        /// Digest of the stalled request.
        digest: Hash,
    },

    /// The view-change escalation timer expired.
    ViewChangeTimer,
}

impl Event {
    /// The processing priority of this event.
    pub fn priority(&self) -> EventPriority {
        match self {
            Event::MessageReceived { .. } => EventPriority::Network,
            Event::MessageVerified { .. } => EventPriority::Internal,
            Event::SubmitRequest { .. } => EventPriority::Client,
            Event::RequestTimer { .. } => EventPriority::Timer,
            Event::ClientWaitTimer { .. } => EventPriority::Timer,
            Event::ViewChangeTimer => EventPriority::Timer,
        }
    }

    /// Event kind name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::MessageReceived { .. } => "MessageReceived",
            Event::MessageVerified { .. } => "MessageVerified",
            Event::SubmitRequest { .. } => "SubmitRequest",
            Event::RequestTimer { .. } => "RequestTimer",
            Event::ClientWaitTimer { .. } => "ClientWaitTimer",
            Event::ViewChangeTimer => "ViewChangeTimer",
        }
    }

    /// The timer that produced this event, if any.
    pub fn timer_id(&self) -> Option<TimerId> {
        match self {
            Event::RequestTimer { seq } => Some(TimerId::Request(*seq)),
            Event::ClientWaitTimer { digest } => Some(TimerId::ClientWait(*digest)),
            Event::ViewChangeTimer => Some(TimerId::ViewChange),
            _ => None,
        }
    }
}
