//! Node events
//!
//! Every state transition a node goes through is reported as a
//! [`NodeEvent`]. Its `Display` impl is the status line shown to the user.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hubchat_core::{format_clock, ElectionId, PeerAddress};

#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    /// This node is now the hub
    Hosting {
        addr: PeerAddress,
        max_connections: usize,
    },
    /// Joined a hub for the first time
    Connected {
        hub_username: String,
        addr: PeerAddress,
    },
    ClientCount {
        connected: usize,
        max: usize,
    },
    Chat {
        username: String,
        text: String,
        timestamp: DateTime<Utc>,
    },
    ServerChat {
        username: String,
        text: String,
        timestamp: DateTime<Utc>,
    },
    PeerJoined {
        username: String,
        text: String,
    },
    PeerLeft {
        username: String,
        text: String,
    },
    /// Hub turned away a connection because it is full
    Rejected {
        addr: String,
    },
    HubShutdown {
        text: String,
    },
    HubLost {
        reason: String,
    },
    ElectionStarted {
        id: ElectionId,
        delay: Duration,
    },
    ElectionWon,
    ElectionLost {
        candidate: String,
    },
    PromotionStarted,
    BindFailed {
        port: u16,
        reason: String,
    },
    Promoted {
        port: u16,
    },
    ReconnectAttempt {
        attempt: u32,
        max: u32,
    },
    Reconnected {
        hub_username: String,
        port: u16,
    },
    /// Fatal failover error; the node no longer runs
    Stopped {
        reason: String,
    },
}

impl NodeEvent {
    /// Whether this event ends the session
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeEvent::Stopped { .. })
    }
}

impl fmt::Display for NodeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeEvent::Hosting {
                addr,
                max_connections,
            } => write!(
                f,
                "Hub listening on {} (up to {} clients)",
                addr, max_connections
            ),
            NodeEvent::Connected { hub_username, addr } => {
                write!(f, "Connected to hub '{}' at {}", hub_username, addr)
            }
            NodeEvent::ClientCount { connected, max } => {
                write!(f, "Connected clients: {}/{}", connected, max)
            }
            NodeEvent::Chat {
                username,
                text,
                timestamp,
            } => write!(f, "[{}] {}: {}", format_clock(*timestamp), username, text),
            NodeEvent::ServerChat {
                username,
                text,
                timestamp,
            } => write!(
                f,
                "[{}] {} (hub): {}",
                format_clock(*timestamp),
                username,
                text
            ),
            NodeEvent::PeerJoined { text, .. }
            | NodeEvent::PeerLeft { text, .. }
            | NodeEvent::HubShutdown { text } => write!(f, ">>> {}", text),
            NodeEvent::Rejected { addr } => {
                write!(f, ">>> Refused connection from {}: chat is full", addr)
            }
            NodeEvent::HubLost { reason } => {
                write!(f, "Lost the hub ({}), starting election", reason)
            }
            NodeEvent::ElectionStarted { id, delay } => write!(
                f,
                "Election started, my id {}; waiting {:.2}s",
                id,
                delay.as_secs_f64()
            ),
            NodeEvent::ElectionWon => write!(f, "Elected as the new hub"),
            NodeEvent::ElectionLost { candidate } => write!(
                f,
                "{} was elected as the new hub, waiting for it to start",
                candidate
            ),
            NodeEvent::PromotionStarted => write!(f, "Promoting to hub..."),
            NodeEvent::BindFailed { port, reason } => {
                write!(f, "Could not listen on port {}: {}", port, reason)
            }
            NodeEvent::Promoted { port } => {
                write!(f, "Promotion complete, hub running on port {}", port)
            }
            NodeEvent::ReconnectAttempt { attempt, max } => {
                write!(f, "Reconnection attempt {}/{}", attempt, max)
            }
            NodeEvent::Reconnected { hub_username, port } => write!(
                f,
                "Reconnected to hub '{}' on port {}",
                hub_username, port
            ),
            NodeEvent::Stopped { reason } => write!(f, "Node stopped: {}", reason),
        }
    }
}
