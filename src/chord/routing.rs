use crate::chord::types::{Digest, RoutingInfo};
use crate::chord::NUM_BITS;
use log::debug;
use serde::{Deserialize, Serialize};

/// How a node picks the next hop when it does not own a digest itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LookupStrategy {
    /// Always hand the search to the successor: O(N) hops
    Naive,
    /// Jump to the closest preceding finger: O(log N) hops
    #[default]
    Finger,
}

impl LookupStrategy {
    fn next_hop(&self, node: &VirtualNode, digest: Digest) -> RoutingInfo {
        match self {
            LookupStrategy::Naive => node.successor.clone(),
            LookupStrategy::Finger => node.closest_preceding_node(digest),
        }
    }
}

/// Result of one local `find_successor` step
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LookupStep {
    /// `next` is the owner of the digest when set, otherwise the node to ask next
    pub found: bool,
    pub next: RoutingInfo,
    pub hops: u32,
}

/// Routing table of one ring identity
#[derive(Clone, Debug)]
pub struct VirtualNode {
    name: String,
    routing_info: RoutingInfo,
    successor: RoutingInfo,
    predecessor: RoutingInfo,
    fingers: Vec<Option<RoutingInfo>>,
    strategy: LookupStrategy,
}

/// Serializable view of a virtual node, written to the state log
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualNodeState {
    pub name: String,
    pub routing_info: RoutingInfo,
    pub successor: RoutingInfo,
    pub predecessor: RoutingInfo,
    pub fingers: Vec<Option<RoutingInfo>>,
}

impl VirtualNode {
    /// A fresh node is a ring of one: successor and predecessor point at itself
    pub fn new(name: impl Into<String>, routing_info: RoutingInfo, strategy: LookupStrategy) -> Self {
        Self {
            name: name.into(),
            successor: routing_info.clone(),
            predecessor: routing_info.clone(),
            routing_info,
            fingers: vec![None; NUM_BITS],
            strategy,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn digest(&self) -> Digest {
        self.routing_info.digest
    }

    pub fn routing_info(&self) -> &RoutingInfo {
        &self.routing_info
    }

    pub fn successor(&self) -> &RoutingInfo {
        &self.successor
    }

    pub fn predecessor(&self) -> &RoutingInfo {
        &self.predecessor
    }

    pub fn fingers(&self) -> &[Option<RoutingInfo>] {
        &self.fingers
    }

    pub fn strategy(&self) -> LookupStrategy {
        self.strategy
    }

    /// Start of the interval covered by `fingers[index]`
    pub fn finger_target(&self, index: usize) -> Digest {
        self.digest().add_power_of_two(index)
    }

    /// One routing step towards the owner of `digest`.
    ///
    /// The owner is reported with `found = true` when it is this node (hops
    /// unchanged) or the successor (one more hop). Otherwise the next node
    /// to ask is returned and `hops` is incremented.
    pub fn find_successor(&self, digest: Digest, hops: u32) -> LookupStep {
        if digest == self.digest() {
            return LookupStep {
                found: true,
                next: self.routing_info.clone(),
                hops,
            };
        }

        if digest.in_open_closed(self.digest(), self.successor.digest) {
            debug!(
                "{} owns {} (successor of {})",
                self.successor.digest,
                digest,
                self.digest()
            );
            return LookupStep {
                found: true,
                next: self.successor.clone(),
                hops: hops + 1,
            };
        }

        let next = self.strategy.next_hop(self, digest);
        debug!("{} forwards search for {} to {}", self.digest(), digest, next.digest);
        LookupStep {
            found: false,
            next,
            hops: hops + 1,
        }
    }

    /// Highest finger strictly between this node and `digest`, or the successor
    pub fn closest_preceding_node(&self, digest: Digest) -> RoutingInfo {
        self.fingers
            .iter()
            .rev()
            .flatten()
            .find(|finger| finger.digest.in_open_open(self.digest(), digest))
            .cloned()
            .unwrap_or_else(|| self.successor.clone())
    }

    /// `candidate` believes it might be our predecessor. Returns true if adopted.
    pub fn notify(&mut self, candidate: &RoutingInfo) -> bool {
        if candidate.digest.in_open_open(self.predecessor.digest, self.digest()) {
            debug!(
                "{} adopts predecessor {} (was {})",
                self.digest(),
                candidate.digest,
                self.predecessor.digest
            );
            self.predecessor = candidate.clone();
            true
        } else {
            false
        }
    }

    pub fn update_successor(&mut self, successor: RoutingInfo) {
        debug!(
            "{} successor {} -> {}",
            self.digest(),
            self.successor.digest,
            successor.digest
        );
        self.successor = successor;
    }

    pub fn set_predecessor(&mut self, predecessor: RoutingInfo) {
        self.predecessor = predecessor;
    }

    /// First half of stabilize: adopt the successor's predecessor if it sits
    /// strictly between us and the successor. Returns true if adopted.
    pub fn consider_successor(&mut self, candidate: &RoutingInfo) -> bool {
        if candidate.digest.in_open_open(self.digest(), self.successor.digest) {
            self.update_successor(candidate.clone());
            true
        } else {
            false
        }
    }

    pub fn update_finger(&mut self, index: usize, finger: RoutingInfo) {
        if index < NUM_BITS {
            self.fingers[index] = Some(finger);
        }
    }

    pub fn snapshot(&self) -> VirtualNodeState {
        VirtualNodeState {
            name: self.name.clone(),
            routing_info: self.routing_info.clone(),
            successor: self.successor.clone(),
            predecessor: self.predecessor.clone(),
            fingers: self.fingers.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: &str = "127.0.0.1:5556";

    fn info(digest: u32, owner: u32) -> RoutingInfo {
        RoutingInfo::new(Digest::new(digest), Digest::new(owner), ADDR)
    }

    fn node(digest: u32, strategy: LookupStrategy) -> VirtualNode {
        VirtualNode::new(
            "node_0",
            RoutingInfo::new(Digest::new(digest), Digest::new(digest), "127.0.0.1:5555"),
            strategy,
        )
    }

    #[test]
    fn test_new_node_points_at_itself() {
        let n = node(160, LookupStrategy::Finger);
        assert_eq!(n.successor(), n.routing_info());
        assert_eq!(n.predecessor(), n.routing_info());
        assert!(n.fingers().iter().all(Option::is_none));
        assert_eq!(n.fingers().len(), NUM_BITS);
    }

    #[test]
    fn test_find_successor_naive() {
        let mut n = node(160, LookupStrategy::Naive);
        n.update_successor(info(30, 45));

        let step = n.find_successor(Digest::new(0), 0);
        assert!(step.found);
        assert_eq!(step.next, info(30, 45));
        assert_eq!(step.hops, 1);

        let step = n.find_successor(Digest::new(50), 0);
        assert!(!step.found);
        assert_eq!(step.next, info(30, 45));
        assert_eq!(step.hops, 1);

        let step = n.find_successor(Digest::new(30), 0);
        assert!(step.found);
        assert_eq!(step.next, info(30, 45));

        let step = n.find_successor(Digest::new(160), 0);
        assert!(step.found);
        assert_eq!(&step.next, n.routing_info());
        assert_eq!(step.hops, 0);
    }

    #[test]
    fn test_find_successor_fingers() {
        let mut n = node(20, LookupStrategy::Finger);
        n.update_successor(info(30, 45));
        for i in 0..4 {
            n.update_finger(i, info(30, 45));
        }
        n.update_finger(4, info(35, 200));
        n.update_finger(5, info(40, 13));
        n.update_finger(6, info(100, 100));
        n.update_finger(7, info(140, 45));

        let step = n.find_successor(Digest::new(0), 0);
        assert!(!step.found);
        assert_eq!(step.next, info(140, 45));
        assert_eq!(step.hops, 1);

        let step = n.find_successor(Digest::new(50), 0);
        assert!(!step.found);
        assert_eq!(step.next, info(40, 13));

        let step = n.find_successor(Digest::new(30), 0);
        assert!(step.found);
        assert_eq!(step.next, info(30, 45));

        let step = n.find_successor(Digest::new(20), 3);
        assert!(step.found);
        assert_eq!(&step.next, n.routing_info());
        assert_eq!(step.hops, 3);
    }

    #[test]
    fn test_closest_preceding_falls_back_to_successor() {
        let mut n = node(20, LookupStrategy::Finger);
        n.update_successor(info(30, 30));
        assert_eq!(n.closest_preceding_node(Digest::new(200)), info(30, 30));

        // fingers past the target are skipped
        n.update_finger(7, info(150, 150));
        assert_eq!(n.closest_preceding_node(Digest::new(100)), info(30, 30));
        assert_eq!(n.closest_preceding_node(Digest::new(200)), info(150, 150));
    }

    #[test]
    fn test_notify_adopts_closer_predecessor() {
        let mut n = node(160, LookupStrategy::Finger);
        assert!(n.notify(&info(100, 100)));
        assert_eq!(n.predecessor(), &info(100, 100));

        assert!(n.notify(&info(150, 150)));
        assert_eq!(n.predecessor(), &info(150, 150));

        // farther away than the current predecessor
        assert!(!n.notify(&info(120, 120)));
        assert_eq!(n.predecessor(), &info(150, 150));

        // notifying ourselves is a no-op
        let me = n.routing_info().clone();
        assert!(!n.notify(&me));
    }

    #[test]
    fn test_consider_successor() {
        let mut n = node(160, LookupStrategy::Finger);
        n.update_successor(info(30, 30));
        assert!(!n.consider_successor(&info(100, 100)));
        assert!(n.consider_successor(&info(200, 200)));
        assert_eq!(n.successor(), &info(200, 200));
        assert!(n.consider_successor(&info(163, 163)));
        assert_eq!(n.successor(), &info(163, 163));
    }

    #[test]
    fn test_snapshot_serializes_wire_field_names() {
        let n = node(24, LookupStrategy::Finger);
        let json = serde_json::to_value(n.snapshot()).unwrap();
        assert_eq!(json["routing_info"]["digest"], 24);
        assert_eq!(json["routing_info"]["owner_digest"], 24);
        assert_eq!(json["fingers"].as_array().unwrap().len(), NUM_BITS);
    }
}
