//! Peer model shared by the hub and its clients

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::invariants::assert_peer_list_invariants;

/// Host and port a peer can be reached at
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    pub port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One member of the group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub username: String,
    pub is_hub: bool,
    /// Logical connection timestamp. Always 0 for the hub.
    pub join_order: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<PeerAddress>,
}

impl PeerRecord {
    pub fn hub(username: impl Into<String>, address: Option<PeerAddress>) -> Self {
        Self {
            username: username.into(),
            is_hub: true,
            join_order: 0.0,
            address,
        }
    }

    pub fn client(
        username: impl Into<String>,
        join_order: f64,
        address: Option<PeerAddress>,
    ) -> Self {
        Self {
            username: username.into(),
            is_hub: false,
            join_order,
            address,
        }
    }
}

/// Current wall-clock time as a join order (seconds since the Unix epoch)
pub fn join_order_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Ordered membership snapshot: the hub first, then clients by ascending
/// join order.
///
/// Only the hub builds lists with [`PeerList::from_records`]. Clients keep
/// whatever the hub last sent them, unmodified.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerList(Vec<PeerRecord>);

impl PeerList {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Build the authoritative list from the hub record and its clients
    pub fn from_records(hub: PeerRecord, clients: impl IntoIterator<Item = PeerRecord>) -> Self {
        let mut clients: Vec<PeerRecord> = clients.into_iter().collect();
        clients.sort_by(|a, b| {
            a.join_order
                .total_cmp(&b.join_order)
                .then_with(|| a.username.cmp(&b.username))
        });

        let mut records = Vec::with_capacity(clients.len() + 1);
        records.push(hub);
        records.extend(clients);

        let list = Self(records);
        assert_peer_list_invariants(&list);
        list
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn records(&self) -> &[PeerRecord] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &PeerRecord> {
        self.0.iter()
    }

    pub fn hub(&self) -> Option<&PeerRecord> {
        self.0.iter().find(|p| p.is_hub)
    }

    pub fn contains(&self, username: &str) -> bool {
        self.0.iter().any(|p| p.username == username)
    }

    /// Non-hub peers sorted by ascending join order (ties broken by name)
    pub fn clients(&self) -> Vec<&PeerRecord> {
        let mut clients: Vec<&PeerRecord> = self.0.iter().filter(|p| !p.is_hub).collect();
        clients.sort_by(|a, b| {
            a.join_order
                .total_cmp(&b.join_order)
                .then_with(|| a.username.cmp(&b.username))
        });
        clients
    }
}

impl From<Vec<PeerRecord>> for PeerList {
    fn from(records: Vec<PeerRecord>) -> Self {
        Self(records)
    }
}
