// Peer transport for loom: a `Network` abstraction with an in-memory hub,
// a libp2p QUIC swarm and an HTTP link to cafes.

pub mod behaviour;
pub mod discovery;
pub mod http;
pub mod memory;
pub mod network;
pub mod peers;
pub mod swarm;
pub mod transport;

pub use behaviour::{LoomBehaviour, LoomEvent};
pub use discovery::{extract_peer_id, parse_multiaddrs};
pub use http::HttpLink;
pub use memory::{MemoryHub, MemoryNetwork};
pub use network::{Inbound, NetError, Network};
pub use peers::PeerTracker;
pub use swarm::{from_libp2p, spawn_swarm, to_libp2p, SwarmCommand, SwarmConfig, SwarmNetwork};
pub use transport::build_swarm;
