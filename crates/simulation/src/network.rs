//! Simulated network conditions: latency, jitter, packet loss,
//! duplication, and partitions.

use std::collections::BTreeSet;
use std::time::Duration;

use rand::Rng;
use rand_chacha::ChaCha8Rng;

/// Network behavior parameters.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Base one-way message latency.
    pub base_latency: Duration,
    /// Jitter as a fraction of base latency (`0.2` means +/-20%).
    pub jitter_fraction: f64,
    /// Probability that any single message is dropped.
    pub packet_loss_rate: f64,
    /// Probability that a delivered message arrives a second time,
    /// with independently sampled latency.
    pub duplication_rate: f64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            base_latency: Duration::from_millis(10),
            jitter_fraction: 0.2,
            packet_loss_rate: 0.0,
            duplication_rate: 0.0,
        }
    }
}

/// Point-to-point delivery model between simulated nodes.
#[derive(Debug)]
pub struct SimulatedNetwork {
    config: NetworkConfig,
    /// Directed links currently cut.
    blocked: BTreeSet<(usize, usize)>,
}

impl SimulatedNetwork {
    /// Create a fully connected network.
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            blocked: BTreeSet::new(),
        }
    }

    /// Cut one directed link.
    pub fn block(&mut self, from: usize, to: usize) {
        self.blocked.insert((from, to));
    }

    /// Cut every link to and from a node.
    pub fn isolate(&mut self, node: usize, num_nodes: usize) {
        for other in 0..num_nodes {
            if other != node {
                self.blocked.insert((node, other));
                self.blocked.insert((other, node));
            }
        }
    }

    /// Restore all links.
    pub fn heal_all(&mut self) {
        self.blocked.clear();
    }

    /// Decide whether a message survives the trip.
    pub fn should_deliver(&self, from: usize, to: usize, rng: &mut ChaCha8Rng) -> bool {
        if self.blocked.contains(&(from, to)) {
            return false;
        }
        if self.config.packet_loss_rate > 0.0 {
            return rng.gen::<f64>() >= self.config.packet_loss_rate;
        }
        true
    }

    /// Decide whether a delivered message also arrives as a duplicate.
    pub fn should_duplicate(&self, rng: &mut ChaCha8Rng) -> bool {
        self.config.duplication_rate > 0.0 && rng.gen::<f64>() < self.config.duplication_rate
    }

    /// Sample a delivery latency: base latency plus uniform jitter.
    pub fn sample_latency(&self, rng: &mut ChaCha8Rng) -> Duration {
        let base = self.config.base_latency.as_secs_f64();
        let jitter = base * self.config.jitter_fraction * (rng.gen::<f64>() * 2.0 - 1.0);
        Duration::from_secs_f64((base + jitter).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_blocked_links_drop_messages() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut network = SimulatedNetwork::new(NetworkConfig::default());

        assert!(network.should_deliver(0, 1, &mut rng));
        network.block(0, 1);
        assert!(!network.should_deliver(0, 1, &mut rng));
        // The reverse direction is still up.
        assert!(network.should_deliver(1, 0, &mut rng));

        network.heal_all();
        assert!(network.should_deliver(0, 1, &mut rng));
    }

    #[test]
    fn test_isolation_cuts_both_directions() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut network = SimulatedNetwork::new(NetworkConfig::default());
        network.isolate(2, 4);

        for other in [0usize, 1, 3] {
            assert!(!network.should_deliver(2, other, &mut rng));
            assert!(!network.should_deliver(other, 2, &mut rng));
        }
        assert!(network.should_deliver(0, 1, &mut rng));
    }

    #[test]
    fn test_latency_within_jitter_bounds() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let network = SimulatedNetwork::new(NetworkConfig {
            base_latency: Duration::from_millis(10),
            jitter_fraction: 0.5,
            packet_loss_rate: 0.0,
            ..NetworkConfig::default()
        });

        for _ in 0..100 {
            let latency = network.sample_latency(&mut rng);
            assert!(latency >= Duration::from_millis(5));
            assert!(latency <= Duration::from_millis(15));
        }
    }

    #[test]
    fn test_duplication_sampling() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let never = SimulatedNetwork::new(NetworkConfig::default());
        for _ in 0..10 {
            assert!(!never.should_duplicate(&mut rng));
        }

        let always = SimulatedNetwork::new(NetworkConfig {
            duplication_rate: 1.0,
            ..NetworkConfig::default()
        });
        for _ in 0..10 {
            assert!(always.should_duplicate(&mut rng));
        }
    }

    #[test]
    fn test_total_loss_drops_everything() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let network = SimulatedNetwork::new(NetworkConfig {
            packet_loss_rate: 1.0,
            ..NetworkConfig::default()
        });
        for _ in 0..10 {
            assert!(!network.should_deliver(0, 1, &mut rng));
        }
    }
}
