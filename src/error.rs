use crate::chord::types::Digest;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChordalError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Chord protocol error: {0}")]
    Chord(#[from] ChordError),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Load balancer error: {0}")]
    Balancer(#[from] BalancerError),

    #[error("Logging setup failed: {0}")]
    Logging(#[from] LoggingError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Peer unreachable: {0}")]
    PeerUnreachable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed message: {0}")]
    Message(#[from] MessageError),

    #[error("Chord error: {0}")]
    Chord(#[from] ChordError),

    #[error("Background task failed: {0}")]
    Task(String),
}

#[derive(Error, Debug)]
pub enum ChordError {
    #[error("No virtual node with digest {0} is hosted here")]
    UnknownIdentity(Digest),

    #[error("Digest {0} is already owned by another node")]
    Collision(Digest),

    #[error("Invalid node ID: {0}")]
    InvalidNodeId(String),

    #[error("Failed to join ring: {0}")]
    JoinFailed(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request dropped before completion: {0}")]
    RequestDropped(String),

    #[error("Dispatch loop is not running")]
    ActorStopped,
}

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Failed to serialize message: {0}")]
    SerializationFailed(String),

    #[error("Failed to deserialize message: {0}")]
    DeserializationFailed(String),

    #[error("Unknown command tag: {0}")]
    UnknownCommand(String),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("I/O error while framing: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum BalancerError {
    #[error("No servers available")]
    NoServers,
}

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Cannot open log file: {0}")]
    File(#[from] std::io::Error),

    #[error("Invalid logger configuration: {0}")]
    Config(#[from] log4rs::config::runtime::ConfigErrors),

    #[error("Logger already installed: {0}")]
    Install(#[from] log::SetLoggerError),
}
