use std::time::Duration;

use libp2p::identity::Keypair;
use libp2p::kad::{self, store::MemoryStore};
use libp2p::request_response::{self, ProtocolSupport};
use libp2p::{identify, StreamProtocol, SwarmBuilder};
use tracing::info;

use loom_shared::constants::{PROTOCOL_VERSION, REQUEST_TIMEOUT_SECS};

use crate::behaviour::LoomBehaviour;

pub fn build_swarm(keypair: Keypair) -> anyhow::Result<libp2p::Swarm<LoomBehaviour>> {
    let swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_quic()
        .with_behaviour(|key| {
            let local_peer_id = key.public().to_peer_id();

            let rpc = request_response::cbor::Behaviour::new(
                [(StreamProtocol::new(PROTOCOL_VERSION), ProtocolSupport::Full)],
                request_response::Config::default()
                    .with_request_timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS)),
            );

            let store = MemoryStore::new(local_peer_id);
            let mut kademlia = kad::Behaviour::new(local_peer_id, store);
            kademlia.set_mode(Some(kad::Mode::Server));

            let identify_config =
                identify::Config::new(PROTOCOL_VERSION.to_string(), key.public())
                    .with_push_listen_addr_updates(true)
                    .with_interval(Duration::from_secs(60));
            let identify = identify::Behaviour::new(identify_config);

            LoomBehaviour {
                rpc,
                kademlia,
                identify,
            }
        })?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    info!(peer_id = %swarm.local_peer_id(), "Built loom swarm with QUIC transport");

    Ok(swarm)
}
