//! Message authentication at the replica boundary.
//!
//! Outer message signatures are verified off the hot path: the engine
//! emits a `VerifyMessage` action and resumes when the runner answers
//! with `MessageVerified`. Nested evidence inside view-change traffic is
//! verified inline, since it arrives in bulk and is already bound by the
//! outer signature.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use pbft_core::Action;
use pbft_types::{ConsensusMessage, KeyPair, Membership, ReplicaId, Signature};

/// Signs outbound messages and gates inbound ones on sender identity
/// and signature validity.
#[derive(Debug)]
pub struct MessageAuthenticator {
    key: KeyPair,
    membership: Arc<Membership>,
    /// Messages dropped for an unknown sender.
    unknown_sender: u64,
    /// Invalid-signature counts per claimed sender.
    invalid: BTreeMap<ReplicaId, u64>,
}

impl MessageAuthenticator {
    /// Create an authenticator for the local replica.
    pub fn new(key: KeyPair, membership: Arc<Membership>) -> Self {
        Self {
            key,
            membership,
            unknown_sender: 0,
            invalid: BTreeMap::new(),
        }
    }

    /// The local signing key.
    pub fn key(&self) -> &KeyPair {
        &self.key
    }

    /// Sign canonical message bytes.
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.key.sign(message)
    }

    /// Gate an inbound message: unknown senders are dropped and counted,
    /// known senders get a delegated verification request.
    pub fn verification_request(&mut self, message: ConsensusMessage) -> Option<Action> {
        let sender = message.replica();
        let public_key = match self.membership.public_key(sender) {
            Some(key) => *key,
            None => {
                self.unknown_sender += 1;
                warn!(
                    sender = %sender,
                    kind = message.type_name(),
                    "dropping message from unknown sender"
                );
                return None;
            }
        };
        let signing_message = message.signing_message();
        Some(Action::VerifyMessage {
            message,
            public_key,
            signing_message,
        })
    }

    /// Record a failed verification for a claimed sender.
    pub fn record_invalid(&mut self, message: &ConsensusMessage) {
        let sender = message.replica();
        let count = self.invalid.entry(sender).or_insert(0);
        *count += 1;
        warn!(
            sender = %sender,
            kind = message.type_name(),
            total = *count,
            "rejected message with invalid signature"
        );
    }

    /// Verify a signature inline against a member's registered key.
    /// Used for nested evidence inside view-change traffic.
    pub fn verify_member(&self, replica: ReplicaId, message: &[u8], signature: &Signature) -> bool {
        match self.membership.public_key(replica) {
            Some(key) => key.verify(message, signature),
            None => false,
        }
    }

    /// Messages dropped for an unknown sender (observability).
    pub fn unknown_sender_count(&self) -> u64 {
        self.unknown_sender
    }

    /// Invalid-signature count for one claimed sender (observability).
    pub fn invalid_count(&self, replica: ReplicaId) -> u64 {
        self.invalid.get(&replica).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbft_types::{Hash, Prepare, SeqNum, View};

    fn setup() -> (Vec<KeyPair>, Arc<Membership>) {
        let keys: Vec<KeyPair> = (0..4u8).map(|i| KeyPair::from_seed(&[i + 1; 32])).collect();
        let membership = Arc::new(
            Membership::new(
                ReplicaId(0),
                keys.iter().map(|k| k.public_key()).collect(),
                1,
            )
            .unwrap(),
        );
        (keys, membership)
    }

    fn prepare_from(key: &KeyPair, replica: ReplicaId) -> ConsensusMessage {
        ConsensusMessage::Prepare(Prepare::signed(
            key,
            replica,
            View(0),
            SeqNum(1),
            Hash::from_bytes(b"req"),
        ))
    }

    #[test]
    fn test_known_sender_gets_verification_request() {
        let (keys, membership) = setup();
        let mut auth = MessageAuthenticator::new(keys[0].clone(), membership);

        let message = prepare_from(&keys[1], ReplicaId(1));
        let action = auth.verification_request(message.clone()).unwrap();

        match action {
            Action::VerifyMessage {
                public_key,
                signing_message,
                ..
            } => {
                assert_eq!(public_key, keys[1].public_key());
                assert!(public_key.verify(&signing_message, message.signature()));
            }
            other => panic!("expected VerifyMessage, got {}", other.type_name()),
        }
    }

    #[test]
    fn test_unknown_sender_dropped() {
        let (keys, membership) = setup();
        let mut auth = MessageAuthenticator::new(keys[0].clone(), membership);

        let outsider = KeyPair::from_seed(&[99u8; 32]);
        let message = prepare_from(&outsider, ReplicaId(7));

        assert!(auth.verification_request(message).is_none());
        assert_eq!(auth.unknown_sender_count(), 1);
    }

    #[test]
    fn test_invalid_counter() {
        let (keys, membership) = setup();
        let mut auth = MessageAuthenticator::new(keys[0].clone(), membership);

        let message = prepare_from(&keys[1], ReplicaId(1));
        auth.record_invalid(&message);
        auth.record_invalid(&message);

        assert_eq!(auth.invalid_count(ReplicaId(1)), 2);
        assert_eq!(auth.invalid_count(ReplicaId(2)), 0);
    }

    #[test]
    fn test_verify_member_inline() {
        let (keys, membership) = setup();
        let auth = MessageAuthenticator::new(keys[0].clone(), membership);

        let bytes = b"evidence";
        let sig = keys[2].sign(bytes);
        assert!(auth.verify_member(ReplicaId(2), bytes, &sig));
        assert!(!auth.verify_member(ReplicaId(3), bytes, &sig));
        assert!(!auth.verify_member(ReplicaId(9), bytes, &sig));
    }
}
