//! Actions: everything a replica asks its runner to do.
//!
//! The state machine performs no I/O itself. Each event produces a batch
//! of actions; the runner executes them (sending, timers, signature
//! checks, delivery callbacks) and feeds results back as events.

use std::time::Duration;

use crate::RequestId;
use pbft_types::{ClientRequest, ConsensusMessage, Hash, PublicKey, ReplicaId, SeqNum, View};

/// Identifies a pending timer so it can be cancelled or replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerId {
    /// Per-slot progress timer.
    Request(SeqNum),
    /// Client-wait timer keyed by request digest.
    ClientWait(Hash),
    /// View-change escalation timer.
    ViewChange,
}

/// An effect requested by the replica state machine.
#[derive(Debug, Clone)]
pub enum Action {
    /// Send a message to every other replica. The engine records its own
    /// votes directly, so no loopback copy is needed.
    Broadcast {
        /// The message to send.
        message: ConsensusMessage,
    },

    /// Arm (or re-arm) a timer.
    SetTimer {
        /// Which timer.
        id: TimerId,
        /// How long until it fires.
        duration: Duration,
    },

    /// Cancel a pending timer. Cancelling an unarmed timer is a no-op.
    CancelTimer {
        /// Which timer.
        id: TimerId,
    },

    /// Verify a message signature off the hot path. The runner answers
    /// with `Event::MessageVerified`.
    VerifyMessage {
        /// The message awaiting verification.
        message: ConsensusMessage,
        /// The sender's registered key.
        public_key: PublicKey,
        /// The canonical bytes the signature must cover.
        signing_message: Vec<u8>,
    },

    /// Hand a committed request to the application, in sequence order.
    DeliverCommitted {
        /// The delivered slot.
        seq: SeqNum,
        /// The ordered request.
        request: ClientRequest,
    },

    /// Tell the submitting client its request was ordered.
    NotifyCommitted {
        /// The submission handle.
        request_id: RequestId,
        /// The request digest.
        digest: Hash,
        /// Where it landed in the log.
        seq: SeqNum,
    },

    /// Tell the submitting client its request was rejected.
    NotifySubmitFailed {
        /// The submission handle.
        request_id: RequestId,
        /// Why it was rejected.
        error: SubmitError,
    },

    /// Signal an unrecoverable safety violation. The replica halts.
    RaiseIntegrityAlarm {
        /// Human-readable diagnosis.
        reason: String,
    },
}

impl Action {
    /// Action kind name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Broadcast { .. } => "Broadcast",
            Action::SetTimer { .. } => "SetTimer",
            Action::CancelTimer { .. } => "CancelTimer",
            Action::VerifyMessage { .. } => "VerifyMessage",
            Action::DeliverCommitted { .. } => "DeliverCommitted",
            Action::NotifyCommitted { .. } => "NotifyCommitted",
            Action::NotifySubmitFailed { .. } => "NotifySubmitFailed",
            Action::RaiseIntegrityAlarm { .. } => "RaiseIntegrityAlarm",
        }
    }

    /// True if the runner answers this action with a follow-up event.
    pub fn is_delegated(&self) -> bool {
        matches!(self, Action::VerifyMessage { .. })
    }
}

/// Why a submission was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    /// This replica is not the primary of the current view.
    #[error("{local} is not the primary of {view} ({primary} is)")]
    NotPrimary {
        /// The replica that was asked.
        local: ReplicaId,
        /// Its current view.
        view: View,
        /// The primary of that view.
        primary: ReplicaId,
    },

    /// The watermark window has no free sequence numbers.
    #[error("watermark window [{low}, {high}) is exhausted")]
    WindowExhausted {
        /// Low watermark (inclusive).
        low: SeqNum,
        /// High watermark (exclusive).
        high: SeqNum,
    },

    /// A view change is in progress; ordering is paused.
    #[error("view change to {target} in progress")]
    ViewChangeInProgress {
        /// The view being voted for.
        target: View,
    },

    /// The replica halted after an integrity alarm.
    #[error("replica halted after integrity alarm")]
    Halted,
}
