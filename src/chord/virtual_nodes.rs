use crate::chord::routing::{LookupStrategy, VirtualNode, VirtualNodeState};
use crate::chord::types::{Digest, RoutingInfo, VirtualNodeSpec};
use crate::error::ChordError;
use log::{info, warn};
use std::collections::BTreeMap;

/// All ring identities hosted by one physical node, keyed by digest.
///
/// The physical node's own identity is always one of them. Every identity
/// shares the owner's address, so routing to any of them means sending to
/// `owner.address` with `owner.digest` as the identity frame.
#[derive(Debug)]
pub struct VirtualNodes {
    owner: RoutingInfo,
    nodes: BTreeMap<Digest, VirtualNode>,
}

impl VirtualNodes {
    pub fn new(
        name: &str,
        owner: RoutingInfo,
        specs: &[VirtualNodeSpec],
        strategy: LookupStrategy,
    ) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(owner.digest, VirtualNode::new(name, owner.clone(), strategy));

        for spec in specs {
            if nodes.contains_key(&spec.digest) {
                warn!(
                    "Ignoring virtual node {}: digest {} is already hosted here",
                    spec.name, spec.digest
                );
                continue;
            }
            let info = RoutingInfo::new(spec.digest, owner.digest, owner.address.clone());
            nodes.insert(spec.digest, VirtualNode::new(spec.name.clone(), info, strategy));
        }

        Self { owner, nodes }
    }

    pub fn owner(&self) -> &RoutingInfo {
        &self.owner
    }

    /// True if `info` lives on this physical node
    pub fn is_local(&self, info: &RoutingInfo) -> bool {
        info.owner_digest == self.owner.digest && info.address == self.owner.address
    }

    pub fn get(&self, digest: Digest) -> Result<&VirtualNode, ChordError> {
        self.nodes
            .get(&digest)
            .ok_or(ChordError::UnknownIdentity(digest))
    }

    pub fn get_mut(&mut self, digest: Digest) -> Result<&mut VirtualNode, ChordError> {
        self.nodes
            .get_mut(&digest)
            .ok_or(ChordError::UnknownIdentity(digest))
    }

    pub fn remove(&mut self, digest: Digest) -> Option<VirtualNode> {
        self.nodes.remove(&digest)
    }

    pub fn digests(&self) -> Vec<Digest> {
        self.nodes.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VirtualNode> {
        self.nodes.values()
    }

    /// Links the local identities into a ring by position. Only valid for
    /// the first node of a network, where there is nobody else to ask.
    pub fn create_ring(&mut self) {
        let infos: Vec<RoutingInfo> = self
            .nodes
            .values()
            .map(|node| node.routing_info().clone())
            .collect();
        let count = infos.len();

        for (i, node) in self.nodes.values_mut().enumerate() {
            node.update_successor(infos[(i + 1) % count].clone());
            node.set_predecessor(infos[(i + count - 1) % count].clone());
        }
    }

    pub fn snapshot(&self) -> Vec<VirtualNodeState> {
        self.nodes.values().map(VirtualNode::snapshot).collect()
    }

    /// Writes the state lines the offline log verifier parses
    pub fn log_state(&self) {
        info!(
            "Node {} managing virtual nodes: {:?}",
            self.owner.digest,
            self.digests().iter().map(Digest::value).collect::<Vec<_>>()
        );
        match serde_json::to_string(&self.snapshot()) {
            Ok(state) => info!("Node state: {}", state),
            Err(e) => warn!("Failed to serialize node state: {}", e),
        }
    }
}
