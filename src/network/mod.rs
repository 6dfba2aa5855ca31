pub mod client;
pub mod codec;
pub mod node;
pub mod transport;

use crate::chord::hash::{hash_key, HashFunction};
use crate::chord::routing::LookupStrategy;
use crate::chord::types::{Digest, VirtualNodeSpec};
use crate::chord::workers::FingerSelection;
use crate::chord::{COMMAND_TIMEOUT, FIX_FINGERS_INTERVAL, JOIN_TIMEOUT, STABILIZE_INTERVAL};
use std::time::Duration;

// Inbound and control channel depth
pub const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Debug)]
pub struct PeerConfig {
    pub name: String,
    pub digest: Option<Digest>, // Derived from `name` when not set
    pub host: String,
    pub internal_port: u16, // Peer traffic; 0 picks a free port
    pub external_port: u16, // Client traffic; 0 picks a free port
    pub stabilize_interval: Duration,
    pub fix_fingers_interval: Duration,
    pub command_timeout: Duration,
    pub join_timeout: Duration,
    pub virtual_nodes: Vec<VirtualNodeSpec>,
    pub strategy: LookupStrategy,
    pub finger_selection: FingerSelection,
    pub hash: HashFunction,
}

impl PeerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            digest: None,
            host: "127.0.0.1".to_string(),
            internal_port: 0,
            external_port: 0,
            stabilize_interval: STABILIZE_INTERVAL,
            fix_fingers_interval: FIX_FINGERS_INTERVAL,
            command_timeout: COMMAND_TIMEOUT,
            join_timeout: JOIN_TIMEOUT,
            virtual_nodes: Vec::new(),
            strategy: LookupStrategy::default(),
            finger_selection: FingerSelection::default(),
            hash: HashFunction::default(),
        }
    }

    pub fn digest(&self) -> Digest {
        self.digest
            .unwrap_or_else(|| hash_key(&self.name, self.hash))
    }

    pub fn internal_bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.internal_port)
    }

    pub fn external_bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.external_port)
    }
}
