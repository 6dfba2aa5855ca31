//! One-shot clients that talk to a node's external endpoint.

use crate::chord::command::{Command, Exit, FindSuccessor};
use crate::chord::types::{Digest, RoutingInfo};
use crate::error::{ChordError, NetworkError};
use crate::network::codec::{Envelope, EnvelopeCodec};
use crate::network::transport::bind;
use futures::{SinkExt, StreamExt};
use log::{debug, info};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LookupResult {
    pub owner: RoutingInfo,
    pub hops: u32,
    pub elapsed: Duration,
}

/// Owner digest clients put in their reply address
const CLIENT_IDENTITY: Digest = Digest::new(0);

#[derive(Clone, Debug)]
pub struct Client {
    host: String,
    timeout: Duration,
}

impl Client {
    pub fn new(timeout: Duration) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            timeout,
        }
    }

    /// Host the reply listener binds to; must be reachable from the ring
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Delivers a single envelope and closes the connection
    pub async fn send_command(
        &self,
        address: &str,
        identity: Digest,
        command: Command,
    ) -> Result<(), NetworkError> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(address))
            .await
            .map_err(|_| NetworkError::ConnectionFailed(format!("timed out connecting to {}", address)))?
            .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", address, e)))?;

        let mut writer = FramedWrite::new(stream, EnvelopeCodec::new());
        writer.send(Envelope::new(identity, command)).await?;
        writer.close().await?;
        Ok(())
    }

    /// Asks the node at `address` to exit
    pub async fn shutdown(&self, address: &str, node: Digest) -> Result<(), NetworkError> {
        info!("Sending Exit to {} at {}", node, address);
        self.send_command(address, node, Command::Exit(Exit)).await
    }

    /// Resolves the owner of `search` starting at virtual node `node`, hosted
    /// by the physical node `owner` at `address`. For a node's own identity
    /// `owner` and `node` are the same digest. The answer comes back on a
    /// short-lived listener.
    pub async fn lookup(
        &self,
        address: &str,
        owner: Digest,
        node: Digest,
        search: Digest,
    ) -> Result<LookupResult, NetworkError> {
        let listener = bind(&format!("{}:0", self.host)).await?;
        let reply_addr = listener.local_addr()?;
        let me = RoutingInfo::new(CLIENT_IDENTITY, CLIENT_IDENTITY, reply_addr.to_string());
        let recipient = RoutingInfo::new(node, owner, address);

        let started = Instant::now();
        let command = FindSuccessor::new(me, recipient, search);
        self.send_command(address, owner, Command::FindSuccessor(command))
            .await?;
        debug!("Waiting for lookup reply on {}", reply_addr);

        let deadline = started + self.timeout;
        loop {
            let (stream, _) = tokio::time::timeout_at(deadline, listener.accept())
                .await
                .map_err(|_| ChordError::Timeout(format!("lookup of {}", search)))??;
            let mut reader = FramedRead::new(stream, EnvelopeCodec::new());

            while let Ok(next) = tokio::time::timeout_at(deadline, reader.next()).await {
                let Some(envelope) = next else { break };
                match envelope?.command {
                    Command::FindSuccessor(reply) if reply.found && reply.search_digest == search => {
                        return Ok(LookupResult {
                            owner: reply.recipient,
                            hops: reply.hops,
                            elapsed: started.elapsed(),
                        });
                    }
                    other => debug!("Ignoring unexpected {}", other.tag()),
                }
            }

            if Instant::now() >= deadline {
                return Err(ChordError::Timeout(format!("lookup of {}", search)).into());
            }
        }
    }
}
