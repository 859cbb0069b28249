//! Bootstrap address parsing.

use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use tracing::{debug, warn};

/// Parse configured bootstrap multiaddrs, skipping malformed entries.
///
/// Entries usually end in `/p2p/<peer id>` so they can be added to the
/// Kademlia routing table as well as dialed.
pub fn parse_multiaddrs<S: AsRef<str>>(raw: &[S]) -> Vec<Multiaddr> {
    raw.iter()
        .map(|s| s.as_ref().trim())
        .filter(|s| !s.is_empty() && !s.starts_with('#'))
        .filter_map(|s| match s.parse::<Multiaddr>() {
            Ok(addr) => {
                debug!(addr = %addr, "bootstrap peer");
                Some(addr)
            }
            Err(e) => {
                warn!(addr = %s, error = %e, "Skipping invalid multiaddr");
                None
            }
        })
        .collect()
}

/// Extract the libp2p `PeerId` from a multiaddr, if one is present.
pub fn extract_peer_id(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter().find_map(|p| match p {
        Protocol::P2p(peer_id) => Some(peer_id),
        _ => None,
    })
}
