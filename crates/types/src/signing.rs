//! Canonical byte encodings for signing.
//!
//! Every protocol message is signed over a domain-separated, fixed-layout
//! byte string built here. Domain tags keep a signature for one message
//! kind from ever verifying as another.

use crate::{Checkpoint, Hash, PrePrepare, PreparedProof, SeqNum, View, ViewChange};

/// Signing bytes for a PrePrepare: the proposal binding `(view, seq)` to
/// a request digest.
pub fn pre_prepare_message(view: View, seq: SeqNum, digest: &Hash) -> Vec<u8> {
    let mut message = Vec::with_capacity(64);
    message.extend_from_slice(b"pre-prepare:");
    message.extend_from_slice(&view.0.to_le_bytes());
    message.extend_from_slice(&seq.0.to_le_bytes());
    message.extend_from_slice(digest.as_bytes());
    message
}

/// Signing bytes for a Prepare vote.
pub fn prepare_message(view: View, seq: SeqNum, digest: &Hash) -> Vec<u8> {
    let mut message = Vec::with_capacity(64);
    message.extend_from_slice(b"prepare:");
    message.extend_from_slice(&view.0.to_le_bytes());
    message.extend_from_slice(&seq.0.to_le_bytes());
    message.extend_from_slice(digest.as_bytes());
    message
}

/// Signing bytes for a Commit vote.
pub fn commit_message(view: View, seq: SeqNum, digest: &Hash) -> Vec<u8> {
    let mut message = Vec::with_capacity(64);
    message.extend_from_slice(b"commit:");
    message.extend_from_slice(&view.0.to_le_bytes());
    message.extend_from_slice(&seq.0.to_le_bytes());
    message.extend_from_slice(digest.as_bytes());
    message
}

/// Signing bytes for a Checkpoint attestation.
pub fn checkpoint_message(seq: SeqNum, state_digest: &Hash) -> Vec<u8> {
    let mut message = Vec::with_capacity(64);
    message.extend_from_slice(b"checkpoint:");
    message.extend_from_slice(&seq.0.to_le_bytes());
    message.extend_from_slice(state_digest.as_bytes());
    message
}

/// Signing bytes for a ViewChange vote.
///
/// The nested evidence (checkpoint proof and prepared certificates) is
/// folded into a single digest so the outer signature commits to all of
/// it without re-encoding every nested message.
pub fn view_change_message(
    new_view: View,
    last_stable: (SeqNum, Hash),
    checkpoint_proof: &[Checkpoint],
    prepared: &[PreparedProof],
) -> Vec<u8> {
    let evidence = evidence_digest(checkpoint_proof, prepared);
    let mut message = Vec::with_capacity(96);
    message.extend_from_slice(b"view-change:");
    message.extend_from_slice(&new_view.0.to_le_bytes());
    message.extend_from_slice(&last_stable.0 .0.to_le_bytes());
    message.extend_from_slice(last_stable.1.as_bytes());
    message.extend_from_slice(evidence.as_bytes());
    message
}

/// Signing bytes for a NewView announcement.
///
/// Commits to the digests of the supporting ViewChange votes and the
/// re-proposed PrePrepares.
pub fn new_view_message(
    view: View,
    view_changes: &[ViewChange],
    pre_prepares: &[PrePrepare],
) -> Vec<u8> {
    let mut hasher = blake3::Hasher::new();
    for vc in view_changes {
        hasher.update(&vc.replica.0.to_le_bytes());
        hasher.update(vc.signature.as_bytes());
    }
    for pp in pre_prepares {
        hasher.update(&pp.seq.0.to_le_bytes());
        hasher.update(pp.digest.as_bytes());
    }
    let evidence = Hash::from_hash_bytes(hasher.finalize().as_bytes());

    let mut message = Vec::with_capacity(64);
    message.extend_from_slice(b"new-view:");
    message.extend_from_slice(&view.0.to_le_bytes());
    message.extend_from_slice(evidence.as_bytes());
    message
}

fn evidence_digest(checkpoint_proof: &[Checkpoint], prepared: &[PreparedProof]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for cp in checkpoint_proof {
        hasher.update(&cp.seq.0.to_le_bytes());
        hasher.update(cp.state_digest.as_bytes());
        hasher.update(&cp.replica.0.to_le_bytes());
        hasher.update(cp.signature.as_bytes());
    }
    for proof in prepared {
        let pp = &proof.pre_prepare;
        hasher.update(&pp.view.0.to_le_bytes());
        hasher.update(&pp.seq.0.to_le_bytes());
        hasher.update(pp.digest.as_bytes());
        for prepare in &proof.prepares {
            hasher.update(&prepare.replica.0.to_le_bytes());
            hasher.update(prepare.signature.as_bytes());
        }
    }
    Hash::from_hash_bytes(hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_separation() {
        let digest = Hash::from_bytes(b"request");
        let pp = pre_prepare_message(View(1), SeqNum(2), &digest);
        let p = prepare_message(View(1), SeqNum(2), &digest);
        let c = commit_message(View(1), SeqNum(2), &digest);

        assert_ne!(pp, p);
        assert_ne!(p, c);
        assert_ne!(pp, c);
    }

    #[test]
    fn test_message_binds_fields() {
        let digest = Hash::from_bytes(b"request");
        let base = prepare_message(View(1), SeqNum(2), &digest);

        assert_ne!(base, prepare_message(View(2), SeqNum(2), &digest));
        assert_ne!(base, prepare_message(View(1), SeqNum(3), &digest));
        assert_ne!(
            base,
            prepare_message(View(1), SeqNum(2), &Hash::from_bytes(b"other"))
        );
    }
}
