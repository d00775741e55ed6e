//! View changes: crashed primaries are voted out and the replica set
//! resumes ordering under the next one.

use std::time::Duration;

use tracing_test::traced_test;

use pbft_consensus::ConsensusConfig;
use pbft_simulation::{NetworkConfig, SimulationRunner};
use pbft_types::{ClientId, ClientRequest, SeqNum, View};

fn fast_config() -> ConsensusConfig {
    ConsensusConfig {
        request_timeout: Duration::from_millis(200),
        view_change_timeout: Duration::from_millis(500),
        checkpoint_interval: 10,
        window_size: 20,
    }
}

fn request(nonce: u64) -> ClientRequest {
    ClientRequest::new(ClientId(1), nonce, format!("op-{nonce}").into_bytes())
}

#[test]
#[traced_test]
fn test_crashed_primary_is_replaced() {
    let mut sim = SimulationRunner::new(1, 42, fast_config(), NetworkConfig::default());

    // One request commits normally under the first primary.
    let first = request(1);
    sim.submit(0, first.clone());
    sim.run_for(Duration::from_millis(500));
    for node in 0..4 {
        assert_eq!(sim.observations(node).delivered.len(), 1);
    }

    // The primary dies. The client gives up waiting and resubmits its
    // next request to every replica it can reach.
    sim.crash(0);
    let second = request(2);
    for node in 1..4 {
        sim.submit(node, second.clone());
    }
    sim.run_for(Duration::from_secs(3));

    // The live replicas moved to view 1 (replica-1 is its primary) and
    // ordered the request there.
    for node in 1..4 {
        assert_eq!(
            sim.node(node).replica().view(),
            View(1),
            "node {node} view"
        );
        let delivered = &sim.observations(node).delivered;
        assert_eq!(delivered.len(), 2, "node {node} delivered count");
        assert_eq!(delivered[0].1, first);
        assert_eq!(delivered[1].1, second);
    }
}

#[test]
#[traced_test]
fn test_view_change_preserves_committed_prefix() {
    let mut sim = SimulationRunner::new(1, 42, fast_config(), NetworkConfig::default());

    let committed: Vec<ClientRequest> = (1..=3).map(request).collect();
    for req in &committed {
        sim.submit(0, req.clone());
    }
    sim.run_for(Duration::from_millis(800));

    sim.crash(0);
    let after = request(4);
    for node in 1..4 {
        sim.submit(node, after.clone());
    }
    sim.run_for(Duration::from_secs(3));

    for node in 1..4 {
        let delivered = &sim.observations(node).delivered;
        assert_eq!(delivered.len(), 4, "node {node} delivered count");
        // The prefix from the old view is untouched.
        for (i, req) in committed.iter().enumerate() {
            assert_eq!(delivered[i].0, SeqNum(i as u64 + 1));
            assert_eq!(&delivered[i].1, req);
        }
        assert_eq!(delivered[3].1, after);
    }
}

#[test]
#[traced_test]
fn test_ordering_resumes_under_new_primary() {
    let mut sim = SimulationRunner::new(1, 42, fast_config(), NetworkConfig::default());
    sim.crash(0);

    // Force the view change with a submission nobody can order yet.
    let trigger = request(1);
    for node in 1..4 {
        sim.submit(node, trigger.clone());
    }
    sim.run_for(Duration::from_secs(3));
    assert_eq!(sim.node(1).replica().view(), View(1));

    // New requests now go straight to the new primary.
    let next = request(2);
    sim.submit(1, next.clone());
    sim.run_for(Duration::from_secs(1));

    for node in 1..4 {
        let delivered = &sim.observations(node).delivered;
        assert!(
            delivered.iter().any(|(_, r)| r == &next),
            "node {node} missing post-change request"
        );
    }
    // The new primary answered its client directly.
    assert!(sim
        .observations(1)
        .committed
        .iter()
        .any(|(_, digest, _)| *digest == next.digest()));
}

#[test]
#[traced_test]
fn test_no_view_change_while_healthy() {
    let mut sim = SimulationRunner::new(1, 42, fast_config(), NetworkConfig::default());
    for nonce in 1..=6 {
        sim.submit(0, request(nonce));
    }
    sim.run_for(Duration::from_secs(5));

    for node in 0..4 {
        assert_eq!(
            sim.node(node).replica().view(),
            View(0),
            "node {node} left view 0 without cause"
        );
    }
}
