use crate::chord::actor::{ChordActor, ControlHandle};
use crate::chord::command::{Command, ControlChannel, FindSuccessor, Ticket};
use crate::chord::routing::VirtualNodeState;
use crate::chord::types::{Digest, RoutingInfo};
use crate::chord::virtual_nodes::VirtualNodes;
use crate::chord::workers::{
    fix_all_fingers, run_finger_maintainer, run_stabilize_worker, stabilize_once,
};
use crate::error::{ChordError, NetworkError};
use crate::network::codec::Envelope;
use crate::network::transport::{bind, spawn_acceptor, ConnectionPool};
use crate::network::{PeerConfig, CHANNEL_CAPACITY};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A physical node before its dispatch loop starts.
///
/// Both listeners are bound on construction so peers and clients can reach
/// it while it joins; inbound traffic queues until [`ChordPeer::start`].
pub struct ChordPeer {
    config: PeerConfig,
    nodes: VirtualNodes,
    pool: ConnectionPool,
    internal_addr: SocketAddr,
    external_addr: SocketAddr,
    internal_rx: mpsc::Receiver<Envelope>,
    external_rx: mpsc::Receiver<Envelope>,
    listeners: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl ChordPeer {
    pub async fn new(config: PeerConfig) -> Result<Self, NetworkError> {
        let internal = bind(&config.internal_bind_addr()).await?;
        let external = bind(&config.external_bind_addr()).await?;
        let internal_addr = internal.local_addr()?;
        let external_addr = external.local_addr()?;

        let digest = config.digest();
        let owner = RoutingInfo::new(digest, digest, internal_addr.to_string());
        let nodes = VirtualNodes::new(&config.name, owner, &config.virtual_nodes, config.strategy);
        info!(
            "Node {} ({}) listening on {} (peers) and {} (clients)",
            config.name, digest, internal_addr, external_addr
        );

        let cancel = CancellationToken::new();
        let (internal_tx, internal_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (external_tx, external_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let listeners = vec![
            spawn_acceptor(internal, internal_tx, cancel.clone()),
            spawn_acceptor(external, external_tx, cancel.clone()),
        ];

        Ok(Self {
            pool: ConnectionPool::new(cancel.clone()),
            config,
            nodes,
            internal_addr,
            external_addr,
            internal_rx,
            external_rx,
            listeners,
            cancel,
        })
    }

    pub fn routing_info(&self) -> &RoutingInfo {
        self.nodes.owner()
    }

    pub fn internal_addr(&self) -> SocketAddr {
        self.internal_addr
    }

    pub fn external_addr(&self) -> SocketAddr {
        self.external_addr
    }

    pub fn nodes(&self) -> &VirtualNodes {
        &self.nodes
    }

    /// Starts a new network made only of this node's identities
    pub fn create(&mut self) {
        self.nodes.create_ring();
        info!("Created network with virtual nodes {:?}", self.nodes.digests());
    }

    /// Finds a successor for every local identity through the node at
    /// `known_address`, waiting for each reply in turn.
    ///
    /// A virtual node whose digest is already taken is dropped. If the
    /// node's own digest is taken the join fails with
    /// [`ChordError::Collision`] and nothing is changed.
    pub async fn join(&mut self, known_address: &str, known_digest: Digest) -> Result<(), NetworkError> {
        let known = RoutingInfo::new(known_digest, known_digest, known_address);
        let primary = self.nodes.owner().digest;
        info!("Joining through {}", known);

        // own identity first so a collision aborts before anything changes
        let mut digests = self.nodes.digests();
        digests.retain(|d| *d != primary);
        digests.insert(0, primary);

        let mut successors = Vec::with_capacity(digests.len());
        for (seq, digest) in digests.iter().enumerate() {
            let ticket = Ticket {
                channel: ControlChannel::Join,
                seq: seq as u64,
            };
            let successor = self.find_successor_via(&known, *digest, ticket).await?;

            if successor.digest == *digest {
                if *digest == primary {
                    error!("Digest {} is already on the ring", digest);
                    return Err(ChordError::Collision(*digest).into());
                }
                warn!("Discarding virtual node {}: digest already on the ring", digest);
                continue;
            }
            successors.push((*digest, successor));
        }

        for digest in self.nodes.digests() {
            if !successors.iter().any(|(d, _)| *d == digest) {
                self.nodes.remove(digest);
            }
        }
        for (digest, successor) in successors {
            info!("Virtual node {} joined with successor {}", digest, successor);
            self.nodes.get_mut(digest)?.update_successor(successor);
        }
        Ok(())
    }

    async fn find_successor_via(
        &mut self,
        known: &RoutingInfo,
        digest: Digest,
        ticket: Ticket,
    ) -> Result<RoutingInfo, NetworkError> {
        let me = self.nodes.get(digest)?.routing_info().clone();
        let command = FindSuccessor::new(me, known.clone(), digest).with_ticket(ticket);
        self.pool.send(
            &known.address,
            Envelope::new(known.owner_digest, Command::FindSuccessor(command)),
        )?;

        let deadline = Instant::now() + self.config.join_timeout;
        loop {
            let envelope = tokio::time::timeout_at(deadline, self.internal_rx.recv())
                .await
                .map_err(|_| {
                    ChordError::Timeout(format!("successor of {} from {}", digest, known))
                })?
                .ok_or(ChordError::ActorStopped)?;

            match envelope.command {
                Command::FindSuccessor(reply) if reply.found && reply.ticket == Some(ticket) => {
                    debug!("Join lookup for {} took {} hops", digest, reply.hops);
                    return Ok(reply.recipient);
                }
                other => debug!("Ignoring {} while joining", other.tag()),
            }
        }
    }

    /// Releases the listeners of a node that never started
    pub async fn close(self) {
        self.cancel.cancel();
        for handle in self.listeners {
            if let Err(e) = handle.await {
                warn!("Listener ended abnormally: {}", e);
            }
        }
    }

    /// Starts the dispatch loop and both drivers
    pub fn start(self) -> RunningPeer {
        let config = self.config;
        let digests = self.nodes.digests();
        let info = self.nodes.owner().clone();

        let (stabilize, stabilize_rx) =
            ControlHandle::channel(ControlChannel::Stabilize, CHANNEL_CAPACITY, config.command_timeout);
        let (fix_fingers, fix_fingers_rx) =
            ControlHandle::channel(ControlChannel::FixFingers, CHANNEL_CAPACITY, config.command_timeout);

        let actor = ChordActor::new(
            self.nodes,
            self.pool,
            self.internal_rx,
            self.external_rx,
            stabilize_rx,
            fix_fingers_rx,
            self.cancel.clone(),
        );
        let actor = tokio::spawn(actor.run());

        let workers = vec![
            tokio::spawn(run_stabilize_worker(
                stabilize.clone(),
                digests.clone(),
                config.stabilize_interval,
                self.cancel.clone(),
            )),
            tokio::spawn(run_finger_maintainer(
                fix_fingers.clone(),
                digests,
                config.fix_fingers_interval,
                config.finger_selection,
                self.cancel.clone(),
            )),
        ];

        RunningPeer {
            info,
            internal_addr: self.internal_addr,
            external_addr: self.external_addr,
            stabilize,
            fix_fingers,
            actor,
            workers,
            listeners: self.listeners,
            cancel: self.cancel,
        }
    }

    /// Serves until an Exit command arrives or Ctrl+C is pressed
    pub async fn run(self) -> Result<(), NetworkError> {
        let running = self.start();
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received shutdown signal"),
                    Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
                }
                running.cancel.cancel();
            }
            _ = running.cancel.cancelled() => {}
        }
        running.wait().await?;
        Ok(())
    }
}

/// A physical node whose dispatch loop is running
pub struct RunningPeer {
    info: RoutingInfo,
    internal_addr: SocketAddr,
    external_addr: SocketAddr,
    stabilize: ControlHandle,
    fix_fingers: ControlHandle,
    actor: JoinHandle<VirtualNodes>,
    workers: Vec<JoinHandle<()>>,
    listeners: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl RunningPeer {
    pub fn routing_info(&self) -> &RoutingInfo {
        &self.info
    }

    pub fn internal_addr(&self) -> SocketAddr {
        self.internal_addr
    }

    pub fn external_addr(&self) -> SocketAddr {
        self.external_addr
    }

    pub async fn stabilize(&self, digest: Digest) -> Result<Option<RoutingInfo>, ChordError> {
        stabilize_once(&self.stabilize, digest).await
    }

    pub async fn fix_fingers(&self, digest: Digest) -> Result<Vec<Option<RoutingInfo>>, ChordError> {
        fix_all_fingers(&self.fix_fingers, digest).await
    }

    pub async fn snapshot(&self) -> Result<Vec<VirtualNodeState>, ChordError> {
        self.stabilize.snapshot().await
    }

    /// Stops the node without waiting for an Exit command
    pub async fn shutdown(self) -> Result<VirtualNodes, NetworkError> {
        self.cancel.cancel();
        self.wait().await
    }

    /// Waits for the dispatch loop to stop, then joins drivers and listeners
    pub async fn wait(self) -> Result<VirtualNodes, NetworkError> {
        let nodes = self
            .actor
            .await
            .map_err(|e| NetworkError::Task(e.to_string()))?;
        self.cancel.cancel();

        for handle in self.workers.into_iter().chain(self.listeners) {
            if let Err(e) = handle.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!("Node {} stopped", self.info.digest);
        Ok(nodes)
    }
}
