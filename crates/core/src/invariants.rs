//! Developer guardrails and invariants
//!
//! Debug assertions for detecting impossible states during development.
//! These checks are compiled out in release builds.

use std::collections::HashSet;

use crate::models::PeerList;

/// Validate that a hub-built peer list is internally consistent
pub fn assert_peer_list_invariants(peers: &PeerList) {
    let records = peers.records();

    // Exactly one hub, and it leads the list
    let hub_count = records.iter().filter(|p| p.is_hub).count();
    debug_assert!(
        hub_count == 1,
        "Peer list has {} hubs, expected exactly 1",
        hub_count
    );
    debug_assert!(
        records.first().map(|p| p.is_hub).unwrap_or(false),
        "Peer list does not start with the hub"
    );

    // Hub always sorts before any client
    if let Some(hub) = records.first() {
        debug_assert!(
            hub.join_order == 0.0,
            "Hub {} has join order {}, expected 0",
            hub.username,
            hub.join_order
        );
    }

    // Clients follow in join order
    debug_assert!(
        records
            .iter()
            .skip(1)
            .collect::<Vec<_>>()
            .windows(2)
            .all(|w| w[0].join_order <= w[1].join_order),
        "Peer list clients are not ordered by join order"
    );

    // Names are unique across the group
    let mut seen = HashSet::new();
    for peer in records {
        debug_assert!(
            seen.insert(peer.username.as_str()),
            "Username {} appears twice in peer list",
            peer.username
        );
    }
}
