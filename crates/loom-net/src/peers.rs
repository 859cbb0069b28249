//! Who the swarm task is connected to, and which of them speak loom.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use libp2p::Multiaddr;
use tracing::debug;

use loom_shared::constants::PROTOCOL_VERSION;
use loom_shared::types::PeerId;

use crate::swarm::from_libp2p;

#[derive(Debug, Clone)]
struct Connection {
    address: Multiaddr,
    since: DateTime<Utc>,
    /// Identify protocol version, once received
    protocol: Option<String>,
}

/// Live connections keyed by libp2p peer. Owned by the swarm task.
#[derive(Debug, Default)]
pub struct PeerTracker {
    connections: HashMap<libp2p::PeerId, Connection>,
}

impl PeerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connected(&mut self, peer: libp2p::PeerId, address: Multiaddr) {
        debug!(peer = %peer, addr = %address, "tracking connection");
        self.connections.entry(peer).or_insert(Connection {
            address,
            since: Utc::now(),
            protocol: None,
        });
    }

    pub fn on_identified(&mut self, peer: &libp2p::PeerId, protocol: &str) {
        if let Some(conn) = self.connections.get_mut(peer) {
            if protocol != PROTOCOL_VERSION {
                debug!(peer = %peer, protocol, "peer speaks another protocol");
            }
            conn.protocol = Some(protocol.to_string());
        }
    }

    pub fn on_disconnected(&mut self, peer: &libp2p::PeerId) {
        if let Some(conn) = self.connections.remove(peer) {
            let secs = (Utc::now() - conn.since).num_seconds();
            debug!(peer = %peer, addr = %conn.address, secs, "connection gone");
        }
    }

    /// Connected peers with ed25519 identities that have not announced a
    /// foreign protocol. Peers not yet identified are included.
    pub fn loom_peers(&self) -> Vec<PeerId> {
        self.connections
            .iter()
            .filter(|(_, conn)| conn.protocol.as_deref().map_or(true, |p| p == PROTOCOL_VERSION))
            .filter_map(|(peer, _)| from_libp2p(peer))
            .collect()
    }
}
