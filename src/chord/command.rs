//! Chord messages.
//!
//! A command carries its own progress: who started it, who it is addressed
//! to now, how many hops it took and whether the answer was found. Executing
//! it against the local virtual nodes yields the next [`Step`], so no
//! per-request state has to be kept on any node along the path.

use crate::chord::types::{Digest, RoutingInfo};
use crate::chord::virtual_nodes::VirtualNodes;
use crate::chord::RING_SIZE;
use crate::error::{ChordError, MessageError};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// Searches that take more hops than there are ring positions are looping
pub const MAX_HOPS: u32 = RING_SIZE;

/// Which local waiter a command reports back to once it completes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlChannel {
    Stabilize,
    FixFingers,
    Join,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub channel: ControlChannel,
    pub seq: u64,
}

/// Multi-hop search for the owner of `search_digest`.
///
/// While `found` is false, `recipient` is the node that should take the next
/// step. Once found, `recipient` holds the owner and the command travels
/// back to `initiator`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindSuccessor {
    pub initiator: RoutingInfo,
    pub recipient: RoutingInfo,
    pub search_digest: Digest,
    pub hops: u32,
    pub found: bool,
    /// Finger slot of the initiator to fill with the result
    #[serde(default)]
    pub finger: Option<usize>,
    #[serde(default)]
    pub ticket: Option<Ticket>,
}

impl FindSuccessor {
    pub fn new(initiator: RoutingInfo, recipient: RoutingInfo, search_digest: Digest) -> Self {
        Self {
            initiator,
            recipient,
            search_digest,
            hops: 0,
            found: false,
            finger: None,
            ticket: None,
        }
    }

    pub fn for_finger(mut self, index: usize) -> Self {
        self.finger = Some(index);
        self
    }

    pub fn with_ticket(mut self, ticket: Ticket) -> Self {
        self.ticket = Some(ticket);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Request,
    Reply,
}

/// Asks `recipient` for its predecessor; the reply carries it in `return_data`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetPredecessor {
    pub initiator: RoutingInfo,
    pub recipient: RoutingInfo,
    #[serde(default)]
    pub return_data: Option<RoutingInfo>,
    pub step: Phase,
    #[serde(default)]
    pub ticket: Option<Ticket>,
}

impl GetPredecessor {
    pub fn new(initiator: RoutingInfo, recipient: RoutingInfo) -> Self {
        Self {
            initiator,
            recipient,
            return_data: None,
            step: Phase::Request,
            ticket: None,
        }
    }

    pub fn with_ticket(mut self, ticket: Ticket) -> Self {
        self.ticket = Some(ticket);
        self
    }
}

/// `initiator` tells `recipient` it might be its predecessor. No reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notify {
    pub initiator: RoutingInfo,
    pub recipient: RoutingInfo,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exit;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    FindSuccessor(FindSuccessor),
    GetPredecessor(GetPredecessor),
    Notify(Notify),
    Exit(Exit),
}

/// What the dispatch loop does after executing a command
#[derive(Debug, PartialEq, Eq)]
pub enum Step {
    /// Deliver `command` to the node described by `to`
    Forward { command: Command, to: RoutingInfo },
    /// A locally started conversation finished
    Complete {
        ticket: Option<Ticket>,
        result: Option<RoutingInfo>,
    },
    /// Nothing further to do
    Done,
    /// Stop the physical node
    Exit,
}

impl Command {
    pub const FIND_SUCCESSOR: &'static str = "FindSuccessor";
    pub const GET_PREDECESSOR: &'static str = "GetPredecessor";
    pub const NOTIFY: &'static str = "Notify";
    pub const EXIT: &'static str = "Exit";

    /// Command-type tag sent in front of the payload
    pub fn tag(&self) -> &'static str {
        match self {
            Command::FindSuccessor(_) => Self::FIND_SUCCESSOR,
            Command::GetPredecessor(_) => Self::GET_PREDECESSOR,
            Command::Notify(_) => Self::NOTIFY,
            Command::Exit(_) => Self::EXIT,
        }
    }

    pub fn encode_payload(&self) -> Result<Vec<u8>, MessageError> {
        let payload = match self {
            Command::FindSuccessor(c) => serde_json::to_vec(c),
            Command::GetPredecessor(c) => serde_json::to_vec(c),
            Command::Notify(c) => serde_json::to_vec(c),
            Command::Exit(c) => serde_json::to_vec(c),
        };
        payload.map_err(|e| MessageError::SerializationFailed(e.to_string()))
    }

    pub fn decode(tag: &str, payload: &[u8]) -> Result<Self, MessageError> {
        fn parse<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T, MessageError> {
            serde_json::from_slice(payload)
                .map_err(|e| MessageError::DeserializationFailed(e.to_string()))
        }

        match tag {
            Self::FIND_SUCCESSOR => Ok(Command::FindSuccessor(parse(payload)?)),
            Self::GET_PREDECESSOR => Ok(Command::GetPredecessor(parse(payload)?)),
            Self::NOTIFY => Ok(Command::Notify(parse(payload)?)),
            Self::EXIT => Ok(Command::Exit(parse(payload)?)),
            other => Err(MessageError::UnknownCommand(other.to_string())),
        }
    }

    /// Advances the conversation by one step using only local state
    pub fn execute(self, nodes: &mut VirtualNodes) -> Result<Step, ChordError> {
        match self {
            Command::FindSuccessor(cmd) => execute_find_successor(cmd, nodes),
            Command::GetPredecessor(cmd) => execute_get_predecessor(cmd, nodes),
            Command::Notify(cmd) => {
                nodes.get_mut(cmd.recipient.digest)?.notify(&cmd.initiator);
                Ok(Step::Done)
            }
            Command::Exit(_) => Ok(Step::Exit),
        }
    }
}

fn execute_find_successor(
    mut cmd: FindSuccessor,
    nodes: &mut VirtualNodes,
) -> Result<Step, ChordError> {
    if cmd.found {
        let node = nodes.get_mut(cmd.initiator.digest)?;
        debug!(
            "Search for {} from {} resolved to {} in {} hops",
            cmd.search_digest, cmd.initiator.digest, cmd.recipient.digest, cmd.hops
        );
        if let Some(index) = cmd.finger {
            node.update_finger(index, cmd.recipient.clone());
        }
        return Ok(Step::Complete {
            ticket: cmd.ticket,
            result: Some(cmd.recipient),
        });
    }

    if cmd.hops > MAX_HOPS {
        warn!(
            "Dropping search for {} from {} after {} hops",
            cmd.search_digest, cmd.initiator.digest, cmd.hops
        );
        return Err(ChordError::InvalidRequest(format!(
            "search for {} exceeded {} hops",
            cmd.search_digest, MAX_HOPS
        )));
    }

    let step = nodes
        .get(cmd.recipient.digest)?
        .find_successor(cmd.search_digest, cmd.hops);
    cmd.hops = step.hops;
    cmd.recipient = step.next;

    let to = if step.found {
        cmd.found = true;
        cmd.initiator.clone()
    } else {
        cmd.recipient.clone()
    };
    Ok(Step::Forward {
        command: Command::FindSuccessor(cmd),
        to,
    })
}

fn execute_get_predecessor(
    mut cmd: GetPredecessor,
    nodes: &mut VirtualNodes,
) -> Result<Step, ChordError> {
    match cmd.step {
        Phase::Request => {
            let predecessor = nodes.get(cmd.recipient.digest)?.predecessor().clone();
            cmd.return_data = Some(predecessor);
            cmd.step = Phase::Reply;
            let to = cmd.initiator.clone();
            Ok(Step::Forward {
                command: Command::GetPredecessor(cmd),
                to,
            })
        }
        Phase::Reply => {
            let node = nodes.get_mut(cmd.initiator.digest)?;
            if let Some(candidate) = &cmd.return_data {
                if node.consider_successor(candidate) {
                    debug!(
                        "{} learned new successor {} from stabilize",
                        cmd.initiator.digest, candidate.digest
                    );
                }
            }
            Ok(Step::Complete {
                ticket: cmd.ticket,
                result: cmd.return_data,
            })
        }
    }
}
