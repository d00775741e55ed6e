//! Client requests: the opaque payloads the engine totally orders.

use crate::{ClientId, Hash};

/// An opaque client request submitted for total ordering.
///
/// The engine never interprets the payload; it orders requests by digest
/// and delivers the bytes unchanged. The `(client, nonce)` pair makes
/// otherwise identical payloads distinct and drives duplicate
/// suppression via the last-reply cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    /// The submitting client.
    pub client: ClientId,
    /// Client-local, monotonically increasing request counter.
    pub nonce: u64,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
}

impl ClientRequest {
    /// Create a new request.
    pub fn new(client: ClientId, nonce: u64, payload: Vec<u8>) -> Self {
        Self {
            client,
            nonce,
            payload,
        }
    }

    /// The request digest: a domain-separated hash over client, nonce
    /// and payload. All protocol messages refer to requests by this
    /// digest only.
    pub fn digest(&self) -> Hash {
        Hash::from_parts(&[
            b"request:",
            &self.client.0.to_le_bytes(),
            &self.nonce.to_le_bytes(),
            &self.payload,
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_deterministic() {
        let a = ClientRequest::new(ClientId(1), 7, b"transfer".to_vec());
        let b = ClientRequest::new(ClientId(1), 7, b"transfer".to_vec());
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_digest_binds_all_fields() {
        let base = ClientRequest::new(ClientId(1), 7, b"transfer".to_vec());

        let other_client = ClientRequest::new(ClientId(2), 7, b"transfer".to_vec());
        let other_nonce = ClientRequest::new(ClientId(1), 8, b"transfer".to_vec());
        let other_payload = ClientRequest::new(ClientId(1), 7, b"mint".to_vec());

        assert_ne!(base.digest(), other_client.digest());
        assert_ne!(base.digest(), other_nonce.digest());
        assert_ne!(base.digest(), other_payload.digest());
    }
}
