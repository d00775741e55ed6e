//! The deterministic state machine boundary.

use std::time::Duration;

use crate::{Action, Event};

/// A deterministic, synchronous state machine.
///
/// All I/O lives in the runner: it delivers events, executes the
/// returned actions, and advances time. Given the same event sequence
/// and timestamps, two instances produce identical actions, which is
/// what makes simulation-based testing of the protocol possible.
pub trait StateMachine {
    /// Process one event, returning the actions it produced.
    fn handle(&mut self, event: Event) -> Vec<Action>;

    /// Advance the machine's notion of elapsed time.
    fn set_time(&mut self, now: Duration);

    /// The machine's current notion of elapsed time.
    fn now(&self) -> Duration;
}
