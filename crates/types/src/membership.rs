//! Static replica membership: the single source of truth for committee
//! size, quorum thresholds, public keys, and primary selection.

use crate::{PublicKey, ReplicaId, View};

/// Errors that can occur when constructing a membership.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MembershipError {
    /// The configuration cannot tolerate the requested number of faults.
    #[error("need at least 3f+1 = {required} replicas to tolerate f = {faults} faults, got {actual}")]
    TooFewReplicas {
        /// Configured fault threshold.
        faults: usize,
        /// Minimum replica count for that threshold.
        required: usize,
        /// Actual replica count.
        actual: usize,
    },

    /// The local replica id is not covered by the key list.
    #[error("local {0} is not a member of the configuration")]
    LocalNotMember(ReplicaId),
}

/// Static membership for one configuration epoch.
///
/// Replica ids are indices into the ordered public key list. `N >= 3f+1`
/// is enforced at construction; quorum intersection then guarantees any
/// two quorums of `2f+1` share at least one honest replica.
#[derive(Debug, Clone)]
pub struct Membership {
    local: ReplicaId,
    public_keys: Vec<PublicKey>,
    faults: usize,
}

impl Membership {
    /// Create a new membership.
    ///
    /// `public_keys[i]` is the key of `ReplicaId(i)`. Fails unless
    /// `public_keys.len() >= 3 * faults + 1` and `local` is a member.
    pub fn new(
        local: ReplicaId,
        public_keys: Vec<PublicKey>,
        faults: usize,
    ) -> Result<Self, MembershipError> {
        let required = 3 * faults + 1;
        if public_keys.len() < required {
            return Err(MembershipError::TooFewReplicas {
                faults,
                required,
                actual: public_keys.len(),
            });
        }
        if local.0 as usize >= public_keys.len() {
            return Err(MembershipError::LocalNotMember(local));
        }
        Ok(Self {
            local,
            public_keys,
            faults,
        })
    }

    /// The local replica's id.
    pub fn local_id(&self) -> ReplicaId {
        self.local
    }

    /// Total number of replicas N.
    pub fn len(&self) -> usize {
        self.public_keys.len()
    }

    /// True if the membership is empty (never, by construction).
    pub fn is_empty(&self) -> bool {
        self.public_keys.is_empty()
    }

    /// The fault threshold f.
    pub fn faults(&self) -> usize {
        self.faults
    }

    /// Quorum size `2f+1`: enough matching messages to certify despite f
    /// faulty replicas.
    pub fn quorum(&self) -> usize {
        2 * self.faults + 1
    }

    /// Prepare quorum `2f`: matching Prepares required alongside the
    /// primary's PrePrepare for a prepared certificate.
    pub fn prepare_quorum(&self) -> usize {
        2 * self.faults
    }

    /// The primary of a view: `view mod N`.
    pub fn primary(&self, view: View) -> ReplicaId {
        ReplicaId(view.0 % self.public_keys.len() as u64)
    }

    /// True if the local replica is the primary of `view`.
    pub fn is_primary(&self, view: View) -> bool {
        self.primary(view) == self.local
    }

    /// Get the public key for a replica, if it is a member.
    pub fn public_key(&self, replica: ReplicaId) -> Option<&PublicKey> {
        self.public_keys.get(replica.0 as usize)
    }

    /// Check membership of a replica id.
    pub fn contains(&self, replica: ReplicaId) -> bool {
        (replica.0 as usize) < self.public_keys.len()
    }

    /// Iterate over all replica ids in order.
    pub fn replicas(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        (0..self.public_keys.len() as u64).map(ReplicaId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyPair;

    fn keys(n: usize) -> Vec<PublicKey> {
        (0..n)
            .map(|i| KeyPair::from_seed(&[i as u8 + 1; 32]).public_key())
            .collect()
    }

    #[test]
    fn test_requires_3f_plus_1() {
        let err = Membership::new(ReplicaId(0), keys(3), 1).unwrap_err();
        assert_eq!(
            err,
            MembershipError::TooFewReplicas {
                faults: 1,
                required: 4,
                actual: 3
            }
        );

        assert!(Membership::new(ReplicaId(0), keys(4), 1).is_ok());
        assert!(Membership::new(ReplicaId(0), keys(7), 2).is_ok());
    }

    #[test]
    fn test_local_must_be_member() {
        let err = Membership::new(ReplicaId(4), keys(4), 1).unwrap_err();
        assert_eq!(err, MembershipError::LocalNotMember(ReplicaId(4)));
    }

    #[test]
    fn test_quorum_sizes() {
        let m = Membership::new(ReplicaId(0), keys(4), 1).unwrap();
        assert_eq!(m.quorum(), 3);
        assert_eq!(m.prepare_quorum(), 2);

        let m = Membership::new(ReplicaId(0), keys(7), 2).unwrap();
        assert_eq!(m.quorum(), 5);
        assert_eq!(m.prepare_quorum(), 4);
    }

    #[test]
    fn test_primary_rotation() {
        let m = Membership::new(ReplicaId(1), keys(4), 1).unwrap();
        assert_eq!(m.primary(View(0)), ReplicaId(0));
        assert_eq!(m.primary(View(1)), ReplicaId(1));
        assert_eq!(m.primary(View(5)), ReplicaId(1));
        assert!(m.is_primary(View(1)));
        assert!(!m.is_primary(View(2)));
    }
}
