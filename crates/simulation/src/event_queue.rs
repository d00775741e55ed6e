//! The simulation's totally ordered event queue.

use std::time::Duration;

use pbft_core::EventPriority;

/// Queue key: events are processed by time, then priority class, then
/// node, then insertion order. Total and deterministic, so two runs
/// with the same seed process events identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EventKey {
    /// Absolute simulation time of the event.
    pub time: Duration,
    /// Priority class, lower first.
    pub priority: EventPriority,
    /// Destination node index.
    pub node: usize,
    /// Insertion tiebreaker.
    pub seq: u64,
}
