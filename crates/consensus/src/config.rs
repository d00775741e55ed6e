//! Engine tuning parameters.

use std::time::Duration;

/// Tuning parameters for one replica.
///
/// All replicas in a deployment must agree on `checkpoint_interval` and
/// `window_size`; the timeouts are local.
#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    /// How long a slot may sit without committing before the replica
    /// suspects the primary.
    pub request_timeout: Duration,

    /// Base timeout for a view change to complete before escalating to
    /// the next view. Doubles per consecutive failure, capped at
    /// `2^6` times this value.
    pub view_change_timeout: Duration,

    /// Take a checkpoint every this many delivered sequences.
    pub checkpoint_interval: u64,

    /// Width of the watermark window: the number of sequence numbers
    /// that may be in flight above the last stable checkpoint.
    pub window_size: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(500),
            view_change_timeout: Duration::from_secs(1),
            checkpoint_interval: 10,
            window_size: 50,
        }
    }
}
