//! Event/action model for the PBFT engine.
//!
//! Replicas are deterministic state machines: events in, actions out.
//! This crate defines that boundary and the identifiers shared across
//! it.

mod action;
mod event;
mod traits;

use std::fmt;

pub use action::{Action, SubmitError, TimerId};
pub use event::{Event, EventPriority};
pub use traits::StateMachine;

/// Caller-chosen handle identifying a submission, echoed back in
/// completion notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request-{}", self.0)
    }
}
