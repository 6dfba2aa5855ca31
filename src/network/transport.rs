//! TCP plumbing between physical nodes.
//!
//! Inbound: every accepted connection gets a reader task that decodes
//! envelopes into a channel owned by the dispatch loop. Outbound: the
//! [`ConnectionPool`] keeps one writer task per remote address.

use crate::error::NetworkError;
use crate::network::codec::{Envelope, EnvelopeCodec};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
// Writers close after this long without traffic and are redialed on demand
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const OUTBOUND_CAPACITY: usize = 256;

pub async fn bind(addr: &str) -> Result<TcpListener, NetworkError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| NetworkError::Bind {
            addr: addr.to_string(),
            source,
        })
}

/// Accepts connections until cancelled, feeding decoded envelopes to `inbound`
pub fn spawn_acceptor(
    listener: TcpListener,
    inbound: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {}", peer);
                    tokio::spawn(read_envelopes(stream, peer, inbound.clone(), cancel.clone()));
                }
                Err(e) => warn!("Failed to accept connection: {}", e),
            }
        }
        debug!("Acceptor stopped");
    })
}

async fn read_envelopes(
    stream: TcpStream,
    peer: SocketAddr,
    inbound: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
) {
    let mut reader = FramedRead::new(stream, EnvelopeCodec::new());
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = reader.next() => next,
        };

        match next {
            Some(Ok(envelope)) => {
                if inbound.send(envelope).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                warn!("Dropping connection from {}: {}", peer, e);
                break;
            }
            None => break,
        }
    }
    debug!("Connection from {} closed", peer);
}

/// Lazily dialed outbound connections, one writer task per address.
///
/// A failed dial or write ends the writer; the next send to that address
/// dials again.
pub struct ConnectionPool {
    connections: HashMap<String, mpsc::Sender<Envelope>>,
    cancel: CancellationToken,
}

impl ConnectionPool {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            connections: HashMap::new(),
            cancel,
        }
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.connections
            .get(address)
            .is_some_and(|sender| !sender.is_closed())
    }

    /// Returns the writer for `address`, spawning one if none is alive
    pub fn ensure_connected(&mut self, address: &str) -> mpsc::Sender<Envelope> {
        if let Some(sender) = self.connections.get(address) {
            if !sender.is_closed() {
                return sender.clone();
            }
        }

        let (sender, receiver) = mpsc::channel(OUTBOUND_CAPACITY);
        tokio::spawn(write_envelopes(
            address.to_string(),
            receiver,
            self.cancel.clone(),
        ));
        self.connections.insert(address.to_string(), sender.clone());
        sender
    }

    /// Queues `envelope` for `address` without waiting for the network
    pub fn send(&mut self, address: &str, envelope: Envelope) -> Result<(), NetworkError> {
        let envelope = match self.ensure_connected(address).try_send(envelope) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(_)) => {
                return Err(NetworkError::PeerUnreachable(format!(
                    "outbound queue to {} is full",
                    address
                )))
            }
            Err(TrySendError::Closed(envelope)) => envelope,
        };

        // The writer died between the check and the send
        self.connections.remove(address);
        self.ensure_connected(address)
            .try_send(envelope)
            .map_err(|_| NetworkError::PeerUnreachable(address.to_string()))
    }
}

async fn write_envelopes(
    address: String,
    mut receiver: mpsc::Receiver<Envelope>,
    cancel: CancellationToken,
) {
    let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&address)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!("Failed to connect to {}: {}", address, e);
            return;
        }
        Err(_) => {
            warn!("Timed out connecting to {}", address);
            return;
        }
    };
    info!("Connected to {}", address);

    let mut writer = FramedWrite::new(stream, EnvelopeCodec::new());
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = tokio::time::timeout(IDLE_TIMEOUT, receiver.recv()) => next,
        };

        let envelope = match next {
            Ok(Some(envelope)) => envelope,
            Ok(None) => break,
            Err(_) => {
                debug!("Closing idle connection to {}", address);
                break;
            }
        };

        if let Err(e) = writer.send(envelope).await {
            warn!("Failed to send to {}: {}", address, e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chord::command::{Command, Exit};
    use crate::chord::types::Digest;

    #[tokio::test]
    async fn test_bind_reports_address() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        assert!(matches!(bind(&addr).await, Err(NetworkError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_pool_delivers_to_acceptor() {
        let cancel = CancellationToken::new();
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let (tx, mut rx) = mpsc::channel(8);
        let acceptor = spawn_acceptor(listener, tx, cancel.clone());

        let mut pool = ConnectionPool::new(cancel.clone());
        let envelope = Envelope::new(Digest::new(42), Command::Exit(Exit));
        pool.send(&addr, envelope.clone()).unwrap();
        pool.send(&addr, envelope.clone()).unwrap();
        assert!(pool.is_connected(&addr));

        for _ in 0..2 {
            let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap();
            assert_eq!(received, Some(envelope.clone()));
        }

        cancel.cancel();
        acceptor.await.unwrap();
    }

    #[tokio::test]
    async fn test_pool_redials_after_failed_connect() {
        let cancel = CancellationToken::new();
        // grab a free port, then release it so the first dial is refused
        let addr = {
            let listener = bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };

        let mut pool = ConnectionPool::new(cancel.clone());
        let envelope = Envelope::new(Digest::new(1), Command::Exit(Exit));
        pool.send(&addr, envelope.clone()).unwrap();

        let sender = pool.ensure_connected(&addr);
        tokio::time::timeout(Duration::from_secs(5), sender.closed())
            .await
            .unwrap();
        assert!(!pool.is_connected(&addr));

        let listener = bind(&addr).await.unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        spawn_acceptor(listener, tx, cancel.clone());
        pool.send(&addr, envelope.clone()).unwrap();
        let received = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(envelope));
        cancel.cancel();
    }
}
