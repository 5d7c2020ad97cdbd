//! Network protocol message types
//!
//! Every message is a JSON object tagged by its `type` field, e.g.
//! `{"type":"join_request","username":"bob","join_order":1714557600.25}`.

use chrono::{DateTime, Utc};
use hubchat_core::PeerList;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Reason sent when the hub is at capacity
pub const CAPACITY_REACHED: &str = "capacity reached";

/// Reason sent when a join collides with a live username
pub const USERNAME_IN_USE: &str = "username already in use";

/// Text of the goodbye the hub sends before closing
pub const HUB_CLOSING: &str = "The hub is closing the chat";

/// Every `type` tag this node understands
const KINDS: &[&str] = &[
    "join_request",
    "join_accepted",
    "join_rejected",
    "error",
    "chat_message",
    "server_message",
    "user_joined",
    "user_left",
    "hub_shutdown",
];

/// Network protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// First frame a client sends
    JoinRequest {
        username: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        join_order: Option<f64>,
    },

    /// Hub admits the client
    JoinAccepted {
        hub_username: String,
        peer_list: PeerList,
        /// Human-readable capacity line
        message: String,
    },

    /// Hub declines the client (capacity)
    JoinRejected { reason: String },

    /// Hub refuses the request for any other reason
    Error { reason: String },

    /// Chat line typed by a client. The hub fills in `username` and
    /// `timestamp` when it relays the line.
    ChatMessage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
    },

    /// Chat line typed by the hub operator
    ServerMessage {
        text: String,
        timestamp: DateTime<Utc>,
    },

    UserJoined {
        username: String,
        text: String,
        peer_list: PeerList,
    },

    UserLeft {
        username: String,
        text: String,
        peer_list: PeerList,
    },

    /// Hub is going away on purpose
    HubShutdown { text: String },
}

impl Message {
    /// Wire tag of this message
    pub fn kind(&self) -> &'static str {
        match self {
            Message::JoinRequest { .. } => "join_request",
            Message::JoinAccepted { .. } => "join_accepted",
            Message::JoinRejected { .. } => "join_rejected",
            Message::Error { .. } => "error",
            Message::ChatMessage { .. } => "chat_message",
            Message::ServerMessage { .. } => "server_message",
            Message::UserJoined { .. } => "user_joined",
            Message::UserLeft { .. } => "user_left",
            Message::HubShutdown { .. } => "hub_shutdown",
        }
    }

    /// Serialize message to JSON bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Protocol(format!("Serialization failed: {}", e)))
    }

    /// Deserialize message from JSON bytes
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| Error::MalformedMessage(e.to_string()))?;

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::MalformedMessage("missing \"type\" field".into()))?;
        if !KINDS.contains(&kind) {
            return Err(Error::UnknownKind(kind.to_string()));
        }

        serde_json::from_value(value).map_err(|e| Error::MalformedMessage(e.to_string()))
    }
}

/// Whether an `error` reason reports a username collision
pub fn is_name_conflict(reason: &str) -> bool {
    let reason = reason.to_lowercase();
    reason.contains("username") || reason.contains("in use")
}

#[cfg(test)]
mod tests {
    use super::*;
    use hubchat_core::PeerRecord;

    #[test]
    fn test_join_request_wire_shape() {
        let msg = Message::JoinRequest {
            username: "bob".to_string(),
            join_order: Some(1.5),
        };
        let json: Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();

        assert_eq!(json["type"], "join_request");
        assert_eq!(json["username"], "bob");
        assert_eq!(json["join_order"], 1.5);
    }

    #[test]
    fn test_join_accepted_roundtrip() {
        let peer_list = PeerList::from_records(
            PeerRecord::hub("alice", None),
            vec![PeerRecord::client("bob", 1.0, None)],
        );
        let msg = Message::JoinAccepted {
            hub_username: "alice".to_string(),
            peer_list,
            message: "connected clients: 1/5".to_string(),
        };

        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.kind(), "join_accepted");
    }

    #[test]
    fn test_client_chat_without_optional_fields() {
        let decoded = Message::decode(br#"{"type":"chat_message","text":"hi"}"#).unwrap();
        assert_eq!(
            decoded,
            Message::ChatMessage {
                username: None,
                text: "hi".to_string(),
                timestamp: None,
            }
        );
    }

    #[test]
    fn test_unknown_kind() {
        let result = Message::decode(br#"{"type":"host_heartbeat","epoch":3}"#);
        assert!(matches!(result, Err(Error::UnknownKind(kind)) if kind == "host_heartbeat"));
    }

    #[test]
    fn test_malformed_messages() {
        assert!(matches!(
            Message::decode(b"not json"),
            Err(Error::MalformedMessage(_))
        ));
        assert!(matches!(
            Message::decode(br#"{"text":"no tag"}"#),
            Err(Error::MalformedMessage(_))
        ));
        assert!(matches!(
            Message::decode(br#"{"type":"join_rejected"}"#),
            Err(Error::MalformedMessage(_))
        ));
    }

    #[test]
    fn test_name_conflict_detection() {
        assert!(is_name_conflict(USERNAME_IN_USE));
        assert!(is_name_conflict("Username taken"));
        assert!(!is_name_conflict("internal error"));
    }
}
