//! PBFT consensus engine: three-phase ordering, checkpointing, and view
//! changes over a deterministic event/action boundary.
//!
//! The entry point is [`ReplicaState`]: feed it validated events, get
//! back the actions to execute. It tolerates `f` Byzantine replicas out
//! of `N >= 3f + 1` and delivers the same requests in the same order on
//! every honest replica.

mod authenticator;
mod checkpoint;
mod config;
mod log;
mod slot;
mod state;
mod view_change;

pub use authenticator::MessageAuthenticator;
pub use checkpoint::{CheckpointOutcome, CheckpointState};
pub use config::ConsensusConfig;
pub use log::{CommittedEntry, ReplicaLog};
pub use slot::{Slot, SlotPhase};
pub use state::ReplicaState;
pub use view_change::{
    build_new_view, validate_new_view, validate_prepared_proof, validate_view_change_evidence,
    NewViewError, ValidatedNewView, ViewChangeState, ViewStatus,
};
