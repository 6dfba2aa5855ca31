use crate::chord::command::{
    Command, ControlChannel, FindSuccessor, GetPredecessor, Notify, Step, Ticket,
};
use crate::chord::routing::VirtualNodeState;
use crate::chord::types::{Digest, RoutingInfo};
use crate::chord::virtual_nodes::VirtualNodes;
use crate::chord::NUM_BITS;
use crate::error::ChordError;
use crate::network::codec::Envelope;
use crate::network::transport::ConnectionPool;
use log::{debug, error, info, warn};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Requests from the background drivers to the dispatch loop.
/// Each reply-bearing message carries a oneshot sender for the answer.
#[derive(Debug)]
pub enum ControlMessage {
    /// First half of stabilize: ask the successor of `digest` for its predecessor
    GetPredecessor {
        digest: Digest,
        respond_to: oneshot::Sender<Option<RoutingInfo>>,
    },
    /// Second half of stabilize: tell the successor of `digest` about it
    Notify { digest: Digest },
    FixFinger {
        digest: Digest,
        index: usize,
        respond_to: oneshot::Sender<Option<RoutingInfo>>,
    },
    Snapshot {
        respond_to: oneshot::Sender<Vec<VirtualNodeState>>,
    },
    LogState,
}

/// Sending half of one control channel
#[derive(Clone, Debug)]
pub struct ControlHandle {
    channel: ControlChannel,
    sender: mpsc::Sender<ControlMessage>,
    timeout: Duration,
}

impl ControlHandle {
    pub fn channel(
        channel: ControlChannel,
        capacity: usize,
        timeout: Duration,
    ) -> (Self, mpsc::Receiver<ControlMessage>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            Self {
                channel,
                sender,
                timeout,
            },
            receiver,
        )
    }

    async fn send(&self, message: ControlMessage) -> Result<(), ChordError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| ChordError::ActorStopped)
    }

    /// Waits at most `timeout` for the dispatch loop to answer
    async fn wait<T>(&self, what: String, recv: oneshot::Receiver<T>) -> Result<T, ChordError> {
        let what = format!("{:?}: {}", self.channel, what);
        match tokio::time::timeout(self.timeout, recv).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(ChordError::RequestDropped(what)),
            Err(_) => Err(ChordError::Timeout(what)),
        }
    }

    pub async fn get_predecessor(&self, digest: Digest) -> Result<Option<RoutingInfo>, ChordError> {
        let (send, recv) = oneshot::channel();
        self.send(ControlMessage::GetPredecessor {
            digest,
            respond_to: send,
        })
        .await?;
        self.wait(format!("predecessor of successor of {}", digest), recv)
            .await
    }

    pub async fn notify(&self, digest: Digest) -> Result<(), ChordError> {
        self.send(ControlMessage::Notify { digest }).await
    }

    pub async fn fix_finger(
        &self,
        digest: Digest,
        index: usize,
    ) -> Result<Option<RoutingInfo>, ChordError> {
        if index >= NUM_BITS {
            return Err(ChordError::InvalidRequest(format!(
                "finger {} out of range 0..{}",
                index, NUM_BITS
            )));
        }
        let (send, recv) = oneshot::channel();
        self.send(ControlMessage::FixFinger {
            digest,
            index,
            respond_to: send,
        })
        .await?;
        self.wait(format!("finger {} of {}", index, digest), recv)
            .await
    }

    pub async fn snapshot(&self) -> Result<Vec<VirtualNodeState>, ChordError> {
        let (send, recv) = oneshot::channel();
        self.send(ControlMessage::Snapshot { respond_to: send })
            .await?;
        self.wait("snapshot".to_string(), recv).await
    }

    pub async fn log_state(&self) -> Result<(), ChordError> {
        self.send(ControlMessage::LogState).await
    }
}

/// The dispatch loop of one physical node.
///
/// It is the only owner of the routing state; peers reach it through the
/// inbound envelope channels and the local drivers through control channels.
pub struct ChordActor {
    nodes: VirtualNodes,
    pool: ConnectionPool,
    internal_rx: mpsc::Receiver<Envelope>,
    external_rx: mpsc::Receiver<Envelope>,
    stabilize_rx: mpsc::Receiver<ControlMessage>,
    fix_fingers_rx: mpsc::Receiver<ControlMessage>,
    pending: HashMap<ControlChannel, (u64, oneshot::Sender<Option<RoutingInfo>>)>,
    next_seq: u64,
    cancel: CancellationToken,
}

impl ChordActor {
    pub fn new(
        nodes: VirtualNodes,
        pool: ConnectionPool,
        internal_rx: mpsc::Receiver<Envelope>,
        external_rx: mpsc::Receiver<Envelope>,
        stabilize_rx: mpsc::Receiver<ControlMessage>,
        fix_fingers_rx: mpsc::Receiver<ControlMessage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            nodes,
            pool,
            internal_rx,
            external_rx,
            stabilize_rx,
            fix_fingers_rx,
            pending: HashMap::new(),
            next_seq: 0,
            cancel,
        }
    }

    /// Runs until an Exit command arrives or the token is cancelled, then
    /// cancels the token so drivers and listeners stop too.
    pub async fn run(mut self) -> VirtualNodes {
        info!(
            "Node {} dispatching for virtual nodes {:?}",
            self.nodes.owner(),
            self.nodes.digests()
        );

        loop {
            let running = tokio::select! {
                _ = self.cancel.cancelled() => false,
                Some(envelope) = self.internal_rx.recv() => self.handle_envelope(envelope),
                Some(envelope) = self.external_rx.recv() => self.handle_envelope(envelope),
                Some(message) = self.stabilize_rx.recv() => {
                    self.handle_control(ControlChannel::Stabilize, message);
                    true
                }
                Some(message) = self.fix_fingers_rx.recv() => {
                    self.handle_control(ControlChannel::FixFingers, message);
                    true
                }
                else => false,
            };
            if !running {
                break;
            }
        }

        info!("Node {} shutting down", self.nodes.owner().digest);
        self.cancel.cancel();
        self.nodes.log_state();
        self.nodes
    }

    fn handle_envelope(&mut self, envelope: Envelope) -> bool {
        let owner = self.nodes.owner().digest;
        if envelope.identity != owner {
            warn!(
                "Node {} dropping {} addressed to {}",
                owner,
                envelope.command.tag(),
                envelope.identity
            );
            return true;
        }
        self.dispatch(envelope.command)
    }

    /// Executes `command` and everything it leads to on this node; remote
    /// steps are handed to the connection pool. Returns false on Exit.
    fn dispatch(&mut self, command: Command) -> bool {
        let mut queue = VecDeque::from([command]);

        while let Some(command) = queue.pop_front() {
            let tag = command.tag();
            match command.execute(&mut self.nodes) {
                Ok(Step::Forward { command, to }) => {
                    if self.nodes.is_local(&to) {
                        queue.push_back(command);
                    } else {
                        self.route(command, &to);
                    }
                }
                Ok(Step::Complete { ticket, result }) => self.complete(ticket, result),
                Ok(Step::Done) => {}
                Ok(Step::Exit) => {
                    info!("Received Exit");
                    return false;
                }
                Err(e) => error!("Dropping {}: {}", tag, e),
            }
        }
        true
    }

    /// Delivers a command this node started to its first recipient
    fn deliver(&mut self, command: Command, to: RoutingInfo) {
        if self.nodes.is_local(&to) {
            self.dispatch(command);
        } else {
            self.route(command, &to);
        }
    }

    fn route(&mut self, command: Command, to: &RoutingInfo) {
        debug!("Sending {} to {}", command.tag(), to);
        let envelope = Envelope::new(to.owner_digest, command);
        if let Err(e) = self.pool.send(&to.address, envelope) {
            warn!("Failed to send to {}: {}", to, e);
        }
    }

    fn handle_control(&mut self, channel: ControlChannel, message: ControlMessage) {
        match message {
            ControlMessage::GetPredecessor { digest, respond_to } => {
                let Ok(node) = self.nodes.get(digest) else {
                    warn!("Stabilize requested for unknown virtual node {}", digest);
                    return;
                };
                let successor = node.successor().clone();
                let command = GetPredecessor::new(node.routing_info().clone(), successor.clone());
                let ticket = self.register(channel, respond_to);
                self.deliver(Command::GetPredecessor(command.with_ticket(ticket)), successor);
            }
            ControlMessage::Notify { digest } => {
                let Ok(node) = self.nodes.get(digest) else {
                    warn!("Notify requested for unknown virtual node {}", digest);
                    return;
                };
                let successor = node.successor().clone();
                let command = Notify {
                    initiator: node.routing_info().clone(),
                    recipient: successor.clone(),
                };
                self.deliver(Command::Notify(command), successor);
            }
            ControlMessage::FixFinger {
                digest,
                index,
                respond_to,
            } => {
                let Ok(node) = self.nodes.get(digest) else {
                    warn!("Finger fix requested for unknown virtual node {}", digest);
                    return;
                };
                let me = node.routing_info().clone();
                let target = node.finger_target(index);
                let ticket = self.register(channel, respond_to);
                let command = FindSuccessor::new(me.clone(), me, target)
                    .for_finger(index)
                    .with_ticket(ticket);
                self.dispatch(Command::FindSuccessor(command));
            }
            ControlMessage::Snapshot { respond_to } => {
                let _ = respond_to.send(self.nodes.snapshot());
            }
            ControlMessage::LogState => self.nodes.log_state(),
        }
    }

    /// Makes `respond_to` the only waiter on `channel`. An older waiter is
    /// dropped; its late reply still updates state but wakes nobody.
    fn register(
        &mut self,
        channel: ControlChannel,
        respond_to: oneshot::Sender<Option<RoutingInfo>>,
    ) -> Ticket {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.pending.insert(channel, (seq, respond_to));
        Ticket { channel, seq }
    }

    fn complete(&mut self, ticket: Option<Ticket>, result: Option<RoutingInfo>) {
        let Some(ticket) = ticket else {
            return;
        };

        match self.pending.remove(&ticket.channel) {
            Some((seq, respond_to)) if seq == ticket.seq => {
                let _ = respond_to.send(result);
            }
            Some(newer) => {
                debug!("Ignoring stale reply {:?}", ticket);
                self.pending.insert(ticket.channel, newer);
            }
            None => debug!("No waiter for {:?}", ticket),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chord::command::Exit;
    use crate::chord::routing::LookupStrategy;
    use crate::chord::types::VirtualNodeSpec;
    use crate::network::transport::{bind, spawn_acceptor};

    const TIMEOUT: Duration = Duration::from_secs(2);

    struct Harness {
        internal: mpsc::Sender<Envelope>,
        stabilize: ControlHandle,
        fix_fingers: ControlHandle,
        cancel: CancellationToken,
        actor: tokio::task::JoinHandle<VirtualNodes>,
    }

    fn start(nodes: VirtualNodes) -> Harness {
        let (internal, internal_rx) = mpsc::channel(16);
        spawn(nodes, internal, internal_rx, CancellationToken::new())
    }

    /// A single-identity node reachable over TCP on an ephemeral port
    async fn start_listening(digest: u32, successor: Option<&RoutingInfo>) -> (Harness, RoutingInfo) {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let owner = RoutingInfo::new(Digest::new(digest), Digest::new(digest), address);
        let mut nodes =
            VirtualNodes::new(&format!("node_{}", digest), owner.clone(), &[], LookupStrategy::Finger);
        if let Some(successor) = successor {
            nodes
                .get_mut(Digest::new(digest))
                .unwrap()
                .update_successor(successor.clone());
        }

        let cancel = CancellationToken::new();
        let (internal, internal_rx) = mpsc::channel(16);
        spawn_acceptor(listener, internal.clone(), cancel.clone());
        (spawn(nodes, internal, internal_rx, cancel), owner)
    }

    fn spawn(
        nodes: VirtualNodes,
        internal: mpsc::Sender<Envelope>,
        internal_rx: mpsc::Receiver<Envelope>,
        cancel: CancellationToken,
    ) -> Harness {
        let (_external, external_rx) = mpsc::channel(16);
        let (stabilize, stabilize_rx) = ControlHandle::channel(ControlChannel::Stabilize, 16, TIMEOUT);
        let (fix_fingers, fix_fingers_rx) =
            ControlHandle::channel(ControlChannel::FixFingers, 16, TIMEOUT);
        let actor = ChordActor::new(
            nodes,
            ConnectionPool::new(cancel.clone()),
            internal_rx,
            external_rx,
            stabilize_rx,
            fix_fingers_rx,
            cancel.clone(),
        );
        Harness {
            internal,
            stabilize,
            fix_fingers,
            cancel,
            actor: tokio::spawn(actor.run()),
        }
    }

    /// One physical node at 160 hosting virtual nodes 10 and 200
    fn local_ring() -> VirtualNodes {
        let owner = RoutingInfo::new(Digest::new(160), Digest::new(160), "127.0.0.1:1");
        let specs: Vec<VirtualNodeSpec> = vec!["a:10".parse().unwrap(), "b:200".parse().unwrap()];
        let mut nodes = VirtualNodes::new("node_0", owner, &specs, LookupStrategy::Finger);
        nodes.create_ring();
        nodes
    }

    #[tokio::test]
    async fn test_local_fix_finger_resolves_without_network() {
        let h = start(local_ring());

        // 160 + 64 = 224 wraps to the identity at 10
        let owner = h.fix_fingers.fix_finger(Digest::new(160), 6).await.unwrap();
        assert_eq!(owner.map(|o| o.digest), Some(Digest::new(10)));

        let state = h.stabilize.snapshot().await.unwrap();
        let node = state
            .iter()
            .find(|s| s.routing_info.digest == Digest::new(160))
            .unwrap();
        assert_eq!(node.fingers[6].as_ref().map(|f| f.digest), Some(Digest::new(10)));

        h.cancel.cancel();
        h.actor.await.unwrap();
    }

    #[tokio::test]
    async fn test_local_stabilize_keeps_created_ring() {
        let h = start(local_ring());

        for digest in [10, 160, 200] {
            let pred = h.stabilize.get_predecessor(Digest::new(digest)).await.unwrap();
            assert!(pred.is_some());
            h.stabilize.notify(Digest::new(digest)).await.unwrap();
        }

        let state = h.stabilize.snapshot().await.unwrap();
        let succ: Vec<u32> = state.iter().map(|s| s.successor.digest.value()).collect();
        let pred: Vec<u32> = state.iter().map(|s| s.predecessor.digest.value()).collect();
        assert_eq!(succ, vec![160, 200, 10]);
        assert_eq!(pred, vec![200, 10, 160]);

        h.cancel.cancel();
        h.actor.await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_stops_loop_and_cancels() {
        let h = start(local_ring());
        h.internal
            .send(Envelope::new(Digest::new(160), Command::Exit(Exit)))
            .await
            .unwrap();

        let nodes = h.actor.await.unwrap();
        assert_eq!(nodes.len(), 3);
        assert!(h.cancel.is_cancelled());
        assert!(matches!(
            h.stabilize.snapshot().await,
            Err(ChordError::ActorStopped)
        ));
    }

    #[tokio::test]
    async fn test_wrong_identity_is_dropped() {
        let h = start(local_ring());
        h.internal
            .send(Envelope::new(Digest::new(7), Command::Exit(Exit)))
            .await
            .unwrap();

        // still serving
        assert_eq!(h.stabilize.snapshot().await.unwrap().len(), 3);
        h.cancel.cancel();
        h.actor.await.unwrap();
    }

    fn predecessor_of(state: &[VirtualNodeState], digest: u32) -> Digest {
        state
            .iter()
            .find(|s| s.routing_info.digest == Digest::new(digest))
            .unwrap()
            .predecessor
            .digest
    }

    #[tokio::test]
    async fn test_stabilize_across_physical_nodes() {
        let (a, a_info) = start_listening(160, None).await;
        // b joined through a: its successor is a, a still points at itself
        let (b, b_info) = start_listening(163, Some(&a_info)).await;

        let pred = b.stabilize.get_predecessor(Digest::new(163)).await.unwrap();
        assert_eq!(pred, Some(a_info.clone()));

        b.stabilize.notify(Digest::new(163)).await.unwrap();
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            let state = a.stabilize.snapshot().await.unwrap();
            if predecessor_of(&state, 160) == Digest::new(163) {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "notify never reached a");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // a's predecessor is now b itself, so b keeps a as successor
        let pred = b.stabilize.get_predecessor(Digest::new(163)).await.unwrap();
        assert_eq!(pred, Some(b_info));
        let state = b.stabilize.snapshot().await.unwrap();
        assert_eq!(state[0].successor, a_info);

        for h in [a, b] {
            h.cancel.cancel();
            h.actor.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_fix_finger_rejects_out_of_range_index() {
        let h = start(local_ring());
        assert!(matches!(
            h.fix_fingers.fix_finger(Digest::new(160), NUM_BITS).await,
            Err(ChordError::InvalidRequest(_))
        ));
        assert!(matches!(
            h.fix_fingers.fix_finger(Digest::new(160), 40).await,
            Err(ChordError::InvalidRequest(_))
        ));
        // still serving
        assert!(h.fix_fingers.fix_finger(Digest::new(160), 0).await.is_ok());
        h.cancel.cancel();
        h.actor.await.unwrap();
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let cancel = CancellationToken::new();
        let (_internal, internal_rx) = mpsc::channel(16);
        let (_external, external_rx) = mpsc::channel(16);
        let (stabilize, stabilize_rx) =
            ControlHandle::channel(ControlChannel::Stabilize, 16, Duration::from_millis(200));
        let (_fix, fix_fingers_rx) = ControlHandle::channel(ControlChannel::FixFingers, 16, TIMEOUT);

        // successor lives on a port nobody listens on
        let owner = RoutingInfo::new(Digest::new(160), Digest::new(160), "127.0.0.1:1");
        let mut nodes = VirtualNodes::new("node_0", owner, &[], LookupStrategy::Finger);
        nodes
            .get_mut(Digest::new(160))
            .unwrap()
            .update_successor(RoutingInfo::new(Digest::new(32), Digest::new(32), "127.0.0.1:9"));

        let actor = ChordActor::new(
            nodes,
            ConnectionPool::new(cancel.clone()),
            internal_rx,
            external_rx,
            stabilize_rx,
            fix_fingers_rx,
            cancel.clone(),
        );
        let handle = tokio::spawn(actor.run());

        assert!(matches!(
            stabilize.get_predecessor(Digest::new(160)).await,
            Err(ChordError::Timeout(_))
        ));
        assert!(matches!(
            stabilize.get_predecessor(Digest::new(99)).await,
            Err(ChordError::RequestDropped(_))
        ));

        cancel.cancel();
        handle.await.unwrap();
    }
}
