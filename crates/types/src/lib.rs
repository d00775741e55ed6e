//! Shared types for the PBFT total-order broadcast engine: hashes, keys,
//! identifiers, membership, and the closed set of protocol messages.

mod crypto;
mod hash;
mod identifiers;
mod membership;
mod message;
mod request;
pub mod signing;

pub use crypto::{KeyPair, PublicKey, Signature};
pub use hash::{Hash, HexError};
pub use identifiers::{ClientId, ReplicaId, SeqNum, View};
pub use membership::{Membership, MembershipError};
pub use message::{
    Checkpoint, Commit, ConsensusMessage, NewView, PrePrepare, Prepare, PreparedProof, ViewChange,
};
pub use request::ClientRequest;
