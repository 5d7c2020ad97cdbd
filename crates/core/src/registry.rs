//! Peer registry - deterministic ordering over a peer list
//!
//! Every node that holds the same [`PeerList`] derives the same rank and the
//! same promotion candidate from it. That shared view is what lets the group
//! pick a new hub without anyone coordinating the vote.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::models::{PeerList, PeerRecord};

/// Identifier a node announces for itself when an election starts
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ElectionId {
    /// Rank among non-hub peers (`None` if the node is missing from the list)
    /// plus its own join order
    Ranked {
        position: Option<usize>,
        join_order: f64,
    },
    /// Derived from the node's own name and join order only. Nodes cannot
    /// compare these against each other.
    Fallback(u64),
}

impl fmt::Display for ElectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElectionId::Ranked {
                position: Some(position),
                join_order,
            } => write!(f, "({}, {:.3})", position, join_order),
            ElectionId::Ranked {
                position: None,
                join_order,
            } => write!(f, "(unranked, {:.3})", join_order),
            ElectionId::Fallback(hash) => write!(f, "#{:016x}", hash),
        }
    }
}

/// Index of `username` among the non-hub peers, ordered by join order
pub fn rank(peers: &PeerList, username: &str) -> Option<usize> {
    peers
        .clients()
        .iter()
        .position(|peer| peer.username == username)
}

/// The non-hub peer that should take over the hub role
pub fn next_candidate(peers: &PeerList) -> Option<&PeerRecord> {
    peers.clients().into_iter().next()
}

/// Compute this node's election id from the last peer list it received
pub fn election_id(peers: &PeerList, username: &str, own_join_order: f64) -> ElectionId {
    if peers.is_empty() {
        let mut hasher = DefaultHasher::new();
        username.hash(&mut hasher);
        own_join_order.to_bits().hash(&mut hasher);
        return ElectionId::Fallback(hasher.finish());
    }

    ElectionId::Ranked {
        position: rank(peers, username),
        join_order: own_join_order,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PeerAddress;

    fn group() -> PeerList {
        PeerList::from_records(
            PeerRecord::hub("alice", Some(PeerAddress::new("localhost", 5555))),
            vec![
                PeerRecord::client("dave", 3.0, None),
                PeerRecord::client("bob", 1.0, None),
                PeerRecord::client("carol", 2.0, None),
            ],
        )
    }

    #[test]
    fn test_rank_skips_hub() {
        let peers = group();
        assert_eq!(rank(&peers, "bob"), Some(0));
        assert_eq!(rank(&peers, "carol"), Some(1));
        assert_eq!(rank(&peers, "dave"), Some(2));
        assert_eq!(rank(&peers, "alice"), None);
        assert_eq!(rank(&peers, "mallory"), None);
    }

    #[test]
    fn test_next_candidate_is_earliest_client() {
        let peers = group();
        let first = next_candidate(&peers).map(|p| p.username.clone());
        let second = next_candidate(&peers).map(|p| p.username.clone());

        assert_eq!(first.as_deref(), Some("bob"));
        assert_eq!(first, second);
    }

    #[test]
    fn test_next_candidate_ignores_received_order() {
        // Lists arrive from the wire in whatever order the hub wrote them
        let peers = PeerList::from(vec![
            PeerRecord::client("carol", 2.0, None),
            PeerRecord::hub("alice", None),
            PeerRecord::client("bob", 1.0, None),
        ]);
        assert_eq!(next_candidate(&peers).map(|p| p.username.as_str()), Some("bob"));
    }

    #[test]
    fn test_no_candidate_without_clients() {
        let hub_only = PeerList::from_records(PeerRecord::hub("alice", None), Vec::new());
        assert!(next_candidate(&hub_only).is_none());
        assert!(next_candidate(&PeerList::new()).is_none());
    }

    #[test]
    fn test_identical_lists_agree() {
        let on_bob = group();
        let on_carol = group();

        assert_eq!(
            election_id(&on_bob, "carol", 2.0),
            election_id(&on_carol, "carol", 2.0)
        );
        assert_eq!(next_candidate(&on_bob), next_candidate(&on_carol));
    }

    #[test]
    fn test_election_id_ranked() {
        let peers = group();
        assert_eq!(
            election_id(&peers, "carol", 2.0),
            ElectionId::Ranked {
                position: Some(1),
                join_order: 2.0
            }
        );
        assert_eq!(
            election_id(&peers, "eve", 9.0),
            ElectionId::Ranked {
                position: None,
                join_order: 9.0
            }
        );
    }

    #[test]
    fn test_election_id_fallback_is_self_consistent() {
        let empty = PeerList::new();
        let a = election_id(&empty, "bob", 1.5);
        let b = election_id(&empty, "bob", 1.5);
        let c = election_id(&empty, "bob", 1.6);

        assert!(matches!(a, ElectionId::Fallback(_)));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
