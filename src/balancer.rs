//! Key-to-server load balancers.
//!
//! [`ConsistentHashBalancer`] puts servers and keys on the ring; a key belongs
//! to the first server at or after its digest, so adding servers only moves
//! the keys that fall between a new server and its predecessor.
//! [`ModNBalancer`] is the baseline: `digest mod N`, which moves almost every
//! key when N changes.

use crate::chord::hash::{hash_key, HashFunction};
use crate::chord::types::Digest;
use crate::error::BalancerError;
use log::debug;
use serde::Serialize;
use std::collections::BTreeMap;

pub trait LoadBalancer {
    /// Adds `count` servers named `server_<i>`
    fn add_servers(&mut self, count: usize);
    fn len(&self) -> usize;
    fn server_for(&self, key: &str) -> Result<&str, BalancerError>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn assign(&self, keys: &[String]) -> Result<BTreeMap<String, String>, BalancerError> {
        keys.iter()
            .map(|key| Ok((key.clone(), self.server_for(key)?.to_string())))
            .collect()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum BalancerKind {
    #[default]
    Consistent,
    ModN,
}

#[derive(Clone, Debug)]
pub struct ConsistentHashBalancer {
    servers: BTreeMap<Digest, String>,
    next_index: usize,
    hash: HashFunction,
}

/// Key assignments before and after growing the server set
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Rebalance {
    pub before: BTreeMap<String, String>,
    pub after: BTreeMap<String, String>,
    pub moved: Vec<String>,
}

impl ConsistentHashBalancer {
    pub fn new(hash: HashFunction) -> Self {
        Self {
            servers: BTreeMap::new(),
            next_index: 0,
            hash,
        }
    }
}

impl LoadBalancer for ConsistentHashBalancer {
    /// A name whose digest is taken replaces the previous holder, so naming
    /// continues until the ring has grown by `count`.
    fn add_servers(&mut self, count: usize) {
        let target = (self.servers.len() + count).min(crate::chord::RING_SIZE as usize);
        while self.servers.len() < target {
            let name = format!("server_{}", self.next_index);
            let digest = hash_key(&name, self.hash);
            if let Some(old) = self.servers.insert(digest, name.clone()) {
                debug!("{} replaces {} at {}", name, old, digest);
            }
            self.next_index += 1;
        }
    }

    fn len(&self) -> usize {
        self.servers.len()
    }

    fn server_for(&self, key: &str) -> Result<&str, BalancerError> {
        let digest = hash_key(key, self.hash);
        self.servers
            .range(digest..)
            .next()
            .or_else(|| self.servers.iter().next())
            .map(|(_, name)| name.as_str())
            .ok_or(BalancerError::NoServers)
    }
}

#[derive(Clone, Debug)]
pub struct ModNBalancer {
    servers: Vec<String>,
    hash: HashFunction,
}

impl ModNBalancer {
    pub fn new(hash: HashFunction) -> Self {
        Self {
            servers: Vec::new(),
            hash,
        }
    }
}

impl LoadBalancer for ModNBalancer {
    fn add_servers(&mut self, count: usize) {
        let start = self.servers.len();
        self.servers
            .extend((start..start + count).map(|i| format!("server_{}", i)));
    }

    fn len(&self) -> usize {
        self.servers.len()
    }

    fn server_for(&self, key: &str) -> Result<&str, BalancerError> {
        if self.servers.is_empty() {
            return Err(BalancerError::NoServers);
        }
        let index = hash_key(key, self.hash).value() as usize % self.servers.len();
        Ok(&self.servers[index])
    }
}

/// Assigns `keys` over `num_servers` servers, adds `additional` more and
/// reports which keys changed owner.
pub fn rebalance(
    kind: BalancerKind,
    num_servers: usize,
    keys: &[String],
    additional: usize,
    hash: HashFunction,
) -> Result<Rebalance, BalancerError> {
    match kind {
        BalancerKind::Consistent => {
            rebalance_with(ConsistentHashBalancer::new(hash), num_servers, keys, additional)
        }
        BalancerKind::ModN => rebalance_with(ModNBalancer::new(hash), num_servers, keys, additional),
    }
}

fn rebalance_with<B: LoadBalancer>(
    mut balancer: B,
    num_servers: usize,
    keys: &[String],
    additional: usize,
) -> Result<Rebalance, BalancerError> {
    balancer.add_servers(num_servers);
    let before = balancer.assign(keys)?;

    balancer.add_servers(additional);
    let after = balancer.assign(keys)?;

    let moved = keys
        .iter()
        .filter(|key| before.get(*key) != after.get(*key))
        .cloned()
        .collect();
    Ok(Rebalance {
        before,
        after,
        moved,
    })
}
