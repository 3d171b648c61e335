use std::io;

use thiserror::Error;

use crate::types::EventTime;

pub type Result<T> = std::result::Result<T, RegistryError>;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("pool \"{0}\" already ended")]
    /// A join arrived after the last member of the pool left or died.
    PoolEnded(String),

    #[error("unknown member: {0}")]
    /// The identity was never part of the pool or has already been removed.
    UnknownMember(String),

    #[error("events from {requested} requested, but history starts at {min_event_time}")]
    /// The requested events were purged from the history.
    StaleRequest {
        requested: EventTime,
        min_event_time: EventTime,
    },

    #[error("implementation {requested} does not match pool's implementation {expected}")]
    /// A join from a process running another implementation than the pool's first member.
    ImplementationMismatch { requested: String, expected: String },

    #[error("pool \"{0}\" not found")]
    PoolNotFound(String),

    #[error("protocol error: {0}")]
    /// Bad magic byte, unknown opcode, malformed body or an error reply from the peer.
    Protocol(String),

    #[error("malformed body: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("{0}")]
    /// Connect, read or write failure. Always recoverable by retrying.
    Network(#[from] io::Error),
}

impl RegistryError {
    pub fn protocol(message: impl Into<String>) -> Self {
        RegistryError::Protocol(message.into())
    }

    /// Whether this error came from the network rather than from the registry
    pub fn is_network(&self) -> bool {
        matches!(self, RegistryError::Network(_))
    }
}

impl From<tokio::time::error::Elapsed> for RegistryError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        RegistryError::Network(io::Error::new(io::ErrorKind::TimedOut, "operation timed out"))
    }
}
