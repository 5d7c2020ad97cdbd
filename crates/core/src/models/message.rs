//! Chat log entries

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

/// What produced a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// A line typed by a client
    ChatMessage,
    /// A line typed by the hub operator
    ServerMessage,
    /// Join/leave/failover notices
    System,
}

/// One line of the session transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub kind: EntryKind,
    pub username: String,
    pub text: String,
}

impl LogEntry {
    pub fn new(
        kind: EntryKind,
        username: impl Into<String>,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp,
            kind,
            username: username.into(),
            text: text.into(),
        }
    }

    pub fn format_timestamp(&self) -> String {
        format_clock(self.timestamp)
    }
}

/// Local wall-clock `HH:MM:SS` used for console and transcript lines
pub fn format_clock(timestamp: DateTime<Utc>) -> String {
    timestamp.with_timezone(&Local).format("%H:%M:%S").to_string()
}
