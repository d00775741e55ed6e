//! Deterministic simulation harness for the PBFT engine.
//!
//! Runs a full replica set on a virtual clock with a simulated network
//! (latency, jitter, loss, partitions) and a seeded RNG: the same seed
//! always produces the same run.

mod event_queue;
mod network;
mod runner;

pub use event_queue::EventKey;
pub use network::{NetworkConfig, SimulatedNetwork};
pub use runner::{NodeObservations, SimulationRunner};
