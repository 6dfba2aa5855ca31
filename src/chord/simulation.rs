//! In-memory ring used for routing experiments.
//!
//! Runs the same [`VirtualNode`] algorithms as the networked node, but a
//! "message" is a direct lookup in a map of nodes, so experiments over
//! hundreds of nodes finish instantly and deterministically.

use crate::chord::command::MAX_HOPS;
use crate::chord::hash::{hash_key, HashFunction};
use crate::chord::routing::{LookupStrategy, VirtualNode};
use crate::chord::types::{Digest, RoutingInfo};
use crate::chord::NUM_BITS;
use crate::error::ChordError;
use log::{debug, info};
use serde::Serialize;
use std::collections::BTreeMap;

pub struct Simulation {
    nodes: BTreeMap<Digest, VirtualNode>,
    strategy: LookupStrategy,
    hash: HashFunction,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NodeEntry {
    pub id: Digest,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FingerEntry {
    /// 1-based finger number, as in the paper
    pub k: usize,
    pub id: Digest,
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FingerTable {
    pub name: String,
    pub id: Digest,
    pub fingers: Vec<FingerEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub successor: Option<Digest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predecessor: Option<Digest>,
}

/// Nodes added by [`Simulation::add_nodes`] and the existing nodes whose
/// successor changed because of them
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Arrivals {
    pub added: Vec<Digest>,
    pub updated: Vec<Digest>,
}

/// A finger that disagrees with the ideal ring
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FingerError {
    pub node: Digest,
    pub index: usize,
    pub actual: Option<Digest>,
    pub expected: Digest,
}

fn sim_info(digest: Digest, name: &str) -> RoutingInfo {
    RoutingInfo::new(digest, digest, format!("sim://{}", name))
}

/// Owner of `target` among sorted `digests`: the first digest at or after it,
/// wrapping to the smallest.
pub fn ideal_successor(digests: &[Digest], target: Digest) -> Option<Digest> {
    digests
        .iter()
        .copied()
        .find(|d| *d >= target)
        .or_else(|| digests.first().copied())
}

impl Simulation {
    pub fn new(strategy: LookupStrategy) -> Self {
        Self {
            nodes: BTreeMap::new(),
            strategy,
            hash: HashFunction::default(),
        }
    }

    /// Builds a correct ring from `<prefix>_0, <prefix>_1, ...` until
    /// `num_nodes` distinct digests exist. A later name replaces an earlier
    /// one with the same digest. Fingers are filled and every node
    /// stabilized once.
    pub fn build(num_nodes: usize, strategy: LookupStrategy, prefix: &str) -> Self {
        let mut sim = Self::new(strategy);
        let num_nodes = num_nodes.min(crate::chord::RING_SIZE as usize);

        let mut names: BTreeMap<Digest, String> = BTreeMap::new();
        let mut i = 0;
        while names.len() < num_nodes {
            let name = format!("{}_{}", prefix, i);
            names.insert(hash_key(&name, sim.hash), name);
            i += 1;
        }

        let infos: Vec<RoutingInfo> = names
            .iter()
            .map(|(digest, name)| sim_info(*digest, name))
            .collect();
        for (k, info) in infos.iter().enumerate() {
            let mut node = VirtualNode::new(names[&info.digest].clone(), info.clone(), strategy);
            node.update_successor(infos[(k + 1) % infos.len()].clone());
            sim.nodes.insert(info.digest, node);
        }

        for digest in sim.digests() {
            sim.fix_fingers(digest);
            if let Err(e) = sim.stabilize(digest) {
                debug!("Initial stabilize of {} failed: {}", digest, e);
            }
        }
        info!("Built simulated ring of {} nodes", sim.len());
        sim
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn digests(&self) -> Vec<Digest> {
        self.nodes.keys().copied().collect()
    }

    pub fn node(&self, digest: Digest) -> Result<&VirtualNode, ChordError> {
        self.nodes
            .get(&digest)
            .ok_or(ChordError::UnknownIdentity(digest))
    }

    fn node_mut(&mut self, digest: Digest) -> Result<&mut VirtualNode, ChordError> {
        self.nodes
            .get_mut(&digest)
            .ok_or(ChordError::UnknownIdentity(digest))
    }

    /// Starts a new network containing only `name`
    pub fn create(&mut self, name: &str) -> Digest {
        let digest = hash_key(name, self.hash);
        self.nodes.insert(
            digest,
            VirtualNode::new(name, sim_info(digest, name), self.strategy),
        );
        digest
    }

    /// Resolves `digest` starting at `start`, returning the owner and hop count
    pub fn lookup(&self, start: Digest, digest: Digest) -> Result<(RoutingInfo, u32), ChordError> {
        let mut current = start;
        let mut hops = 0;
        loop {
            let step = self.node(current)?.find_successor(digest, hops);
            if step.found {
                return Ok((step.next, step.hops));
            }
            if step.hops > MAX_HOPS {
                return Err(ChordError::InvalidRequest(format!(
                    "lookup of {} from {} did not terminate",
                    digest, start
                )));
            }
            current = step.next.digest;
            hops = step.hops;
        }
    }

    /// Adds `name` by asking `known` for its successor. Fails without
    /// touching the ring when the digest is already taken.
    pub fn join(&mut self, name: &str, known: Digest) -> Result<Digest, ChordError> {
        let digest = hash_key(name, self.hash);
        let (successor, _) = self.lookup(known, digest)?;
        if successor.digest == digest {
            return Err(ChordError::Collision(digest));
        }

        let mut node = VirtualNode::new(name, sim_info(digest, name), self.strategy);
        node.update_successor(successor);
        self.nodes.insert(digest, node);
        debug!("{} joined simulated ring as {}", name, digest);
        Ok(digest)
    }

    /// Joins `count` nodes named `<prefix>_0, <prefix>_1, ...` through the
    /// lowest node. Each newcomer and the node just before it are stabilized
    /// right away, then every finger in the ring is refreshed. Names whose
    /// digest is taken are skipped.
    pub fn add_nodes(&mut self, count: usize, prefix: &str) -> Result<Arrivals, ChordError> {
        let mut arrivals = Arrivals {
            added: Vec::with_capacity(count),
            updated: Vec::with_capacity(count),
        };
        let mut i = 0;
        while arrivals.added.len() < count && self.len() < crate::chord::RING_SIZE as usize {
            let name = format!("{}_{}", prefix, i);
            i += 1;
            let known = *self
                .nodes
                .keys()
                .next()
                .ok_or_else(|| ChordError::InvalidRequest("empty ring".into()))?;

            let digest = match self.join(&name, known) {
                Ok(digest) => digest,
                Err(ChordError::Collision(digest)) => {
                    debug!("Skipping {}: {} is taken", name, digest);
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.stabilize(digest)?;

            let previous = self
                .nodes
                .range(..digest)
                .next_back()
                .or_else(|| self.nodes.iter().next_back())
                .map(|(d, _)| *d)
                .unwrap_or(digest);
            self.stabilize(previous)?;

            arrivals.added.push(digest);
            arrivals.updated.push(previous);
        }

        self.fix_all_fingers();
        Ok(arrivals)
    }

    /// One stabilize step for `digest`. Returns true if any pointer moved.
    pub fn stabilize(&mut self, digest: Digest) -> Result<bool, ChordError> {
        let successor = self.node(digest)?.successor().digest;
        let candidate = self.node(successor)?.predecessor().clone();
        let moved = self.node_mut(digest)?.consider_successor(&candidate);

        let me = self.node(digest)?.routing_info().clone();
        let successor = self.node(digest)?.successor().digest;
        let notified = self.node_mut(successor)?.notify(&me);
        Ok(moved || notified)
    }

    /// Stabilizes every node once in ring order. Returns true if anything moved.
    pub fn stabilize_round(&mut self) -> Result<bool, ChordError> {
        let mut changed = false;
        for digest in self.digests() {
            changed |= self.stabilize(digest)?;
        }
        Ok(changed)
    }

    /// Runs rounds until nothing moves; returns how many rounds changed
    /// something, or `None` if still moving after `max_rounds`.
    pub fn stabilize_until_stable(&mut self, max_rounds: usize) -> Result<Option<usize>, ChordError> {
        for round in 0..=max_rounds {
            if !self.stabilize_round()? {
                return Ok(Some(round));
            }
        }
        Ok(None)
    }

    pub fn fix_finger(&mut self, digest: Digest, index: usize) -> Result<(), ChordError> {
        let target = self.node(digest)?.finger_target(index);
        let (owner, _) = self.lookup(digest, target)?;
        self.node_mut(digest)?.update_finger(index, owner);
        Ok(())
    }

    /// Refreshes every finger of `digest`; unknown digests are ignored
    pub fn fix_fingers(&mut self, digest: Digest) {
        for index in 0..NUM_BITS {
            if let Err(e) = self.fix_finger(digest, index) {
                debug!("Could not fix finger {} of {}: {}", index, digest, e);
            }
        }
    }

    pub fn fix_all_fingers(&mut self) {
        for digest in self.digests() {
            self.fix_fingers(digest);
        }
    }

    /// Mean hop count of looking up each key from the lowest node
    pub fn average_hops(&self, keys: &[String]) -> Result<f64, ChordError> {
        let start = *self
            .nodes
            .keys()
            .next()
            .ok_or_else(|| ChordError::InvalidRequest("empty ring".into()))?;
        if keys.is_empty() {
            return Ok(0.0);
        }

        let mut total = 0u64;
        for key in keys {
            let (_, hops) = self.lookup(start, hash_key(key, self.hash))?;
            total += u64::from(hops);
        }
        Ok(total as f64 / keys.len() as f64)
    }

    /// Digests visited by following successor pointers `steps` times
    pub fn walk_successors(&self, start: Digest, steps: usize) -> Result<Vec<Digest>, ChordError> {
        let mut path = Vec::with_capacity(steps + 1);
        let mut current = start;
        path.push(current);
        for _ in 0..steps {
            current = self.node(current)?.successor().digest;
            path.push(current);
        }
        Ok(path)
    }

    pub fn node_table(&self) -> Vec<NodeEntry> {
        self.nodes
            .values()
            .map(|node| NodeEntry {
                id: node.digest(),
                name: node.name().to_string(),
            })
            .collect()
    }

    pub fn finger_table(&self, digest: Digest) -> Result<FingerTable, ChordError> {
        let node = self.node(digest)?;
        let fingers = node
            .fingers()
            .iter()
            .enumerate()
            .filter_map(|(position, finger)| {
                let finger = finger.as_ref()?;
                let name = self.nodes.get(&finger.digest)?.name().to_string();
                Some(FingerEntry {
                    k: position + 1,
                    id: finger.digest,
                    name,
                })
            })
            .collect();

        Ok(FingerTable {
            name: node.name().to_string(),
            id: digest,
            fingers,
            successor: None,
            predecessor: None,
        })
    }

    /// [`Simulation::finger_table`] plus the node's successor and predecessor
    pub fn finger_table_links(&self, digest: Digest) -> Result<FingerTable, ChordError> {
        let node = self.node(digest)?;
        let mut table = self.finger_table(digest)?;
        table.successor = Some(node.successor().digest);
        table.predecessor = Some(node.predecessor().digest);
        Ok(table)
    }

    /// Fingers a fully converged ring would have for `digest`
    pub fn ideal_fingers(&self, digest: Digest) -> Vec<Digest> {
        let digests = self.digests();
        (0..NUM_BITS)
            .filter_map(|i| ideal_successor(&digests, digest.add_power_of_two(i)))
            .collect()
    }

    pub fn finger_errors(&self) -> Vec<FingerError> {
        let mut errors = Vec::new();
        for node in self.nodes.values() {
            let expected = self.ideal_fingers(node.digest());
            for (index, (actual, expected)) in node.fingers().iter().zip(expected).enumerate() {
                let actual = actual.as_ref().map(|f| f.digest);
                if actual != Some(expected) {
                    errors.push(FingerError {
                        node: node.digest(),
                        index,
                        actual,
                        expected,
                    });
                }
            }
        }
        errors
    }
}
