//! Offline check of a ring from node logs.
//!
//! Reads the `Node <d> managing virtual nodes: [..]` and `Node state: [..]`
//! lines every node writes after a stabilize round, then compares the last
//! reported fingers against the ideal ring built from every identity seen.

use crate::chord::routing::VirtualNodeState;
use crate::chord::simulation::{ideal_successor, FingerError};
use crate::chord::types::Digest;
use crate::chord::{NUM_BITS, RING_SIZE};
use crate::error::MessageError;
use log::warn;
use std::collections::BTreeMap;
use std::io::BufRead;

const STATE_MARKER: &str = "Node state: ";
const MANAGING_MARKER: &str = " managing virtual nodes: ";

#[derive(Debug, Default)]
pub struct LogReport {
    /// Latest state reported for each virtual node
    pub nodes: BTreeMap<Digest, VirtualNodeState>,
    /// Physical owner of every identity that was started
    pub owners: BTreeMap<Digest, Digest>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LoadStatistics {
    pub mean: f64,
    pub std_dev: f64,
}

fn parse_managing(line: &str) -> Option<(Digest, Vec<Digest>)> {
    let (head, list) = line.split_once(MANAGING_MARKER)?;
    let owner = head.rsplit("Node ").next()?.trim().parse().ok()?;
    let digests = serde_json::from_str(list.trim()).ok()?;
    Some((owner, digests))
}

pub fn parse_log<R: BufRead>(reader: R) -> Result<LogReport, MessageError> {
    let mut report = LogReport::default();

    for line in reader.lines() {
        let line = line?;
        if let Some((_, state)) = line.split_once(STATE_MARKER) {
            match serde_json::from_str::<Vec<VirtualNodeState>>(state.trim()) {
                Ok(nodes) => {
                    for node in nodes {
                        report.nodes.insert(node.routing_info.digest, node);
                    }
                }
                Err(e) => warn!("Skipping unreadable state line: {}", e),
            }
        } else if let Some((owner, digests)) = parse_managing(&line) {
            for digest in digests {
                report.owners.insert(digest, owner);
            }
        }
    }
    Ok(report)
}

impl LogReport {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.owners.is_empty()
    }

    /// Fingers that disagree with the ring formed by every reported node
    pub fn finger_errors(&self) -> Vec<FingerError> {
        let digests: Vec<Digest> = self.nodes.keys().copied().collect();
        let mut errors = Vec::new();

        for (digest, node) in &self.nodes {
            for index in 0..NUM_BITS {
                let Some(expected) = ideal_successor(&digests, digest.add_power_of_two(index)) else {
                    continue;
                };
                let actual = node
                    .fingers
                    .get(index)
                    .and_then(|f| f.as_ref())
                    .map(|f| f.digest);
                if actual != Some(expected) {
                    errors.push(FingerError {
                        node: *digest,
                        index,
                        actual,
                        expected,
                    });
                }
            }
        }
        errors
    }

    /// Ring positions each physical node is responsible for
    pub fn load_by_owner(&self) -> BTreeMap<Digest, u32> {
        let mut load = BTreeMap::new();
        let Some((last, _)) = self.owners.iter().next_back() else {
            return load;
        };

        let mut previous = last.value();
        for (digest, owner) in &self.owners {
            let span = (digest.value() + RING_SIZE - previous) % RING_SIZE;
            // a single identity owns the whole ring
            let span = if span == 0 { RING_SIZE } else { span };
            *load.entry(*owner).or_insert(0) += span;
            previous = digest.value();
        }
        load
    }

    /// Mean and sample standard deviation of the per-owner load
    pub fn load_statistics(&self) -> Option<LoadStatistics> {
        let load: Vec<f64> = self.load_by_owner().values().map(|l| f64::from(*l)).collect();
        if load.len() < 2 {
            return None;
        }
        let mean = load.iter().sum::<f64>() / load.len() as f64;
        let variance =
            load.iter().map(|l| (l - mean).powi(2)).sum::<f64>() / (load.len() - 1) as f64;
        Some(LoadStatistics {
            mean,
            std_dev: variance.sqrt(),
        })
    }
}
