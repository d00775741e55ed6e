//! Domain-specific identifier types.

use std::fmt;

/// Replica identifier: a stable index `0..N-1`, bound to a public key for
/// the lifetime of a configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReplicaId(pub u64);

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "replica-{}", self.0)
    }
}

/// View number: a monotonically increasing epoch during which one fixed
/// replica acts as primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct View(pub u64);

impl View {
    /// The initial view.
    pub const GENESIS: Self = View(0);

    /// Get the next view.
    pub fn next(self) -> Self {
        View(self.0 + 1)
    }
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "view-{}", self.0)
    }
}

/// Sequence number: position in the totally ordered log. Assigned only by
/// the primary of the current view, within the watermark window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SeqNum(pub u64);

impl SeqNum {
    /// Sequence zero: nothing has been assigned. The first real sequence
    /// number is 1.
    pub const ZERO: Self = SeqNum(0);

    /// Get the next sequence number.
    pub fn next(self) -> Self {
        SeqNum(self.0 + 1)
    }

    /// Get the previous sequence number (None below 1).
    pub fn prev(self) -> Option<Self> {
        if self.0 > 0 {
            Some(SeqNum(self.0 - 1))
        } else {
            None
        }
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq-{}", self.0)
    }
}

/// Client identifier, used for duplicate suppression via the last-reply
/// cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}
