use chordal::chord::routing::VirtualNodeState;
use chordal::chord::simulation::ideal_successor;
use chordal::chord::types::{Digest, VirtualNodeSpec};
use chordal::chord::NUM_BITS;
use chordal::error::{ChordError, NetworkError};
use chordal::network::client::Client;
use chordal::network::node::{ChordPeer, RunningPeer};
use chordal::network::PeerConfig;
use std::future::Future;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(10);

fn d(value: u32) -> Digest {
    Digest::new(value)
}

/// Drivers effectively never fire; tests step the protocol by hand
fn manual_config(name: &str) -> PeerConfig {
    let mut config = PeerConfig::new(name);
    config.stabilize_interval = Duration::from_secs(3600);
    config.fix_fingers_interval = Duration::from_secs(3600);
    config.command_timeout = Duration::from_secs(2);
    config
}

fn node_state(state: &[VirtualNodeState], digest: u32) -> &VirtualNodeState {
    state
        .iter()
        .find(|s| s.routing_info.digest == d(digest))
        .unwrap_or_else(|| panic!("no virtual node {}", digest))
}

/// Polls `peer` until `check` holds on its state, failing after `WAIT`
async fn eventually<F>(peer: &RunningPeer, what: &str, check: F)
where
    F: Fn(&[VirtualNodeState]) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let state = peer.snapshot().await.unwrap();
        if check(&state) {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}: {:?}", what, state);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, future).await.expect("timed out")
}

async fn create(config: PeerConfig) -> RunningPeer {
    let mut peer = ChordPeer::new(config).await.unwrap();
    peer.create();
    peer.start()
}

async fn join(config: PeerConfig, known: &RunningPeer) -> RunningPeer {
    let mut peer = ChordPeer::new(config).await.unwrap();
    let address = known.internal_addr().to_string();
    peer.join(&address, known.routing_info().digest).await.unwrap();
    peer.start()
}

fn successor(state: &[VirtualNodeState], digest: u32) -> u32 {
    node_state(state, digest).successor.digest.value()
}

fn predecessor(state: &[VirtualNodeState], digest: u32) -> u32 {
    node_state(state, digest).predecessor.digest.value()
}

fn fingers(state: &[VirtualNodeState], digest: u32) -> Vec<Option<u32>> {
    node_state(state, digest)
        .fingers
        .iter()
        .map(|f| f.as_ref().map(|f| f.digest.value()))
        .collect()
}

#[tokio::test]
async fn test_networked_ring() {
    let a = create(manual_config("node_0")).await;
    assert_eq!(a.routing_info().digest, d(160));

    let b = join(manual_config("node_1"), &a).await;
    assert_eq!(b.routing_info().digest, d(163));
    let state = b.snapshot().await.unwrap();
    assert_eq!(successor(&state, 163), 160);

    within(b.stabilize(d(163))).await.unwrap();
    eventually(&a, "a.pred = b", |s| predecessor(s, 160) == 163).await;

    within(a.stabilize(d(160))).await.unwrap();
    let state = a.snapshot().await.unwrap();
    assert_eq!(successor(&state, 160), 163);
    eventually(&b, "b.pred = a", |s| predecessor(s, 163) == 160).await;

    let a_fingers = within(a.fix_fingers(d(160))).await.unwrap();
    let a_fingers: Vec<u32> = a_fingers.iter().map(|f| f.as_ref().unwrap().digest.value()).collect();
    assert_eq!(a_fingers, vec![163, 163, 160, 160, 160, 160, 160, 160]);

    within(b.fix_fingers(d(163))).await.unwrap();
    let state = b.snapshot().await.unwrap();
    assert_eq!(fingers(&state, 163), vec![Some(160); NUM_BITS]);

    let c = join(manual_config("node_2"), &a).await;
    assert_eq!(c.routing_info().digest, d(32));
    assert_eq!(successor(&c.snapshot().await.unwrap(), 32), 160);

    within(c.stabilize(d(32))).await.unwrap();
    eventually(&a, "a.pred = c", |s| predecessor(s, 160) == 32).await;

    within(b.stabilize(d(163))).await.unwrap();
    assert_eq!(successor(&b.snapshot().await.unwrap(), 163), 32);
    eventually(&c, "c.pred = b", |s| predecessor(s, 32) == 163).await;

    let client = Client::new(WAIT);
    let result = client
        .lookup(&a.external_addr().to_string(), d(160), d(160), d(100))
        .await
        .unwrap();
    assert_eq!(result.owner.digest, d(160));
    assert_eq!(result.hops, 3);

    // a lookup that the entry node answers itself
    let result = client
        .lookup(&b.external_addr().to_string(), d(163), d(163), d(163))
        .await
        .unwrap();
    assert_eq!(result.owner.digest, d(163));
    assert_eq!(result.hops, 0);

    client
        .shutdown(&a.external_addr().to_string(), d(160))
        .await
        .unwrap();
    let nodes = within(a.wait()).await.unwrap();
    assert_eq!(nodes.digests(), vec![d(160)]);

    within(b.shutdown()).await.unwrap();
    within(c.shutdown()).await.unwrap();
}

#[tokio::test]
async fn test_join_collision_is_rejected() {
    let a = create(manual_config("node_0")).await;

    let mut config = manual_config("impostor");
    config.digest = Some(d(160));
    let mut impostor = ChordPeer::new(config).await.unwrap();
    let address = a.internal_addr().to_string();
    let result = impostor.join(&address, d(160)).await;
    assert!(matches!(
        result,
        Err(NetworkError::Chord(ChordError::Collision(digest))) if digest == d(160)
    ));
    impostor.close().await;

    let state = a.snapshot().await.unwrap();
    assert_eq!(state.len(), 1);
    assert_eq!(successor(&state, 160), 160);
    assert_eq!(predecessor(&state, 160), 160);
    within(a.shutdown()).await.unwrap();
}

#[tokio::test]
async fn test_join_discards_colliding_virtual_node() {
    let mut config = manual_config("node_0");
    config.virtual_nodes = vec!["vnode_a:80".parse::<VirtualNodeSpec>().unwrap()];
    let a = create(config).await;
    let state = a.snapshot().await.unwrap();
    assert_eq!((successor(&state, 80), successor(&state, 160)), (160, 80));

    let mut config = manual_config("node_1");
    config.virtual_nodes = vec![
        "vnode_dup:80".parse().unwrap(),
        "vnode_b:200".parse().unwrap(),
    ];
    let b = join(config, &a).await;

    let state = b.snapshot().await.unwrap();
    let hosted: Vec<Digest> = state.iter().map(|s| s.routing_info.digest).collect();
    assert_eq!(hosted, vec![d(163), d(200)]);
    assert_eq!(successor(&state, 163), 80);
    assert_eq!(successor(&state, 200), 80);
    for node in &state {
        assert_eq!(node.routing_info.owner_digest, d(163));
        assert_eq!(node.routing_info.address, b.internal_addr().to_string());
    }

    // a lookup entering at a virtual node is addressed to its physical owner
    let result = Client::new(WAIT)
        .lookup(&b.external_addr().to_string(), d(163), d(200), d(201))
        .await
        .unwrap();
    assert_eq!(result.owner.digest, d(80));
    assert_eq!(result.hops, 1);

    within(a.shutdown()).await.unwrap();
    within(b.shutdown()).await.unwrap();
}

#[tokio::test]
async fn test_background_drivers_converge() {
    let fast = |name: &str| {
        let mut config = PeerConfig::new(name);
        config.stabilize_interval = Duration::from_millis(50);
        config.fix_fingers_interval = Duration::from_millis(20);
        config
    };

    let a = create(fast("node_0")).await;
    let b = join(fast("node_1"), &a).await;
    let c = join(fast("node_2"), &a).await;

    let ring = [d(32), d(160), d(163)];
    let converged = move |digest: u32| {
        move |s: &[VirtualNodeState]| {
            let node = node_state(s, digest);
            let expected: Vec<Option<Digest>> = (0..NUM_BITS)
                .map(|i| ideal_successor(&ring, node.routing_info.digest.add_power_of_two(i)))
                .collect();
            let actual: Vec<Option<Digest>> =
                node.fingers.iter().map(|f| f.as_ref().map(|f| f.digest)).collect();
            let k = ring.iter().position(|r| *r == d(digest)).unwrap();
            node.successor.digest == ring[(k + 1) % 3]
                && node.predecessor.digest == ring[(k + 2) % 3]
                && actual == expected
        }
    };

    eventually(&a, "node_0 converged", converged(160)).await;
    eventually(&b, "node_1 converged", converged(163)).await;
    eventually(&c, "node_2 converged", converged(32)).await;

    for peer in [a, b, c] {
        within(peer.shutdown()).await.unwrap();
    }
}
