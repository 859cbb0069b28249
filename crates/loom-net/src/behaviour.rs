//! Composed libp2p `NetworkBehaviour` for loom nodes.
//!
//! Envelopes travel over a CBOR request-response protocol. Kademlia keeps a
//! routing table so requests can reach peers that are not yet connected,
//! and identify feeds it with listen addresses.

use libp2p::{
    identify,
    kad::{self, store::MemoryStore},
    request_response::{self, cbor},
    swarm::NetworkBehaviour,
};

use loom_shared::protocol::Envelope;

/// Requests carry an envelope; responses carry an optional reply envelope.
pub type EnvelopeCodec = cbor::Behaviour<Envelope, Option<Envelope>>;

#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "LoomEvent")]
pub struct LoomBehaviour {
    pub rpc: EnvelopeCodec,
    pub kademlia: kad::Behaviour<MemoryStore>,
    pub identify: identify::Behaviour,
}

#[derive(Debug)]
pub enum LoomEvent {
    Rpc(request_response::Event<Envelope, Option<Envelope>>),
    Kademlia(kad::Event),
    Identify(identify::Event),
}

impl From<request_response::Event<Envelope, Option<Envelope>>> for LoomEvent {
    fn from(event: request_response::Event<Envelope, Option<Envelope>>) -> Self {
        LoomEvent::Rpc(event)
    }
}

impl From<kad::Event> for LoomEvent {
    fn from(event: kad::Event) -> Self {
        LoomEvent::Kademlia(event)
    }
}

impl From<identify::Event> for LoomEvent {
    fn from(event: identify::Event) -> Self {
        LoomEvent::Identify(event)
    }
}
