//! Network error types

use std::io;

/// Network result type
pub type Result<T> = std::result::Result<T, Error>;

/// Network errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Could not listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The peer went away (EOF on an established connection)
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Unknown message kind: {0}")]
    UnknownKind(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Username already in use")]
    UsernameTaken,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The hub declined the join (capacity)
    #[error("Connection rejected: {0}")]
    Rejected(String),

    /// Any other error reply from the hub
    #[error("Hub replied with an error: {0}")]
    Remote(String),

    #[error("Not connected")]
    NotConnected,

    #[error("No clients connected")]
    NoPeers,

    #[error("Already running as {0}")]
    AlreadyRunning(&'static str),

    #[error("Node is shutting down")]
    ShuttingDown,

    #[error("Could not become hub on any port from {first} to {last}")]
    PromotionExhausted { first: u16, last: u16 },

    #[error("Could not reconnect after {0} attempts")]
    ReconnectionExhausted(u32),
}

impl Error {
    /// Errors after which the node cannot keep running
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::PromotionExhausted { .. } | Error::ReconnectionExhausted(_)
        )
    }
}
