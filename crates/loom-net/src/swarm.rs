//! Swarm orchestration with the tokio mpsc command pattern.
//!
//! The swarm event loop runs in a dedicated task. [`SwarmNetwork`] talks to
//! it through a command channel; inbound envelopes leave it as [`Inbound`]
//! values whose replies are routed back through the same command channel.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::request_response::{self, OutboundFailure, OutboundRequestId, ResponseChannel};
use libp2p::{identify, kad, swarm::SwarmEvent, Multiaddr};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use loom_shared::constants::{DEFAULT_QUIC_PORT, DIRECT_SEND_TIMEOUT_SECS};
use loom_shared::protocol::Envelope;
use loom_shared::types::PeerId;
use loom_shared::Identity;

use crate::behaviour::LoomEvent;
use crate::discovery::extract_peer_id;
use crate::network::{Inbound, NetError, Network};
use crate::peers::PeerTracker;
use crate::transport::build_swarm;

type Reply = Result<Option<Envelope>, NetError>;

// ---------------------------------------------------------------------------
// Peer id mapping
// ---------------------------------------------------------------------------

/// The libp2p peer id of a loom peer (both are the same ed25519 key).
pub fn to_libp2p(peer: &PeerId) -> Result<libp2p::PeerId, NetError> {
    let key = libp2p::identity::ed25519::PublicKey::try_from_bytes(&peer.0)
        .map_err(|e| NetError::Transport(e.to_string()))?;
    Ok(libp2p::identity::PublicKey::from(key).to_peer_id())
}

/// Recover the loom peer id from an identity-hashed libp2p peer id.
pub fn from_libp2p(peer: &libp2p::PeerId) -> Option<PeerId> {
    let key = libp2p::identity::PublicKey::try_decode_protobuf(peer.as_ref().digest()).ok()?;
    let ed = key.try_into_ed25519().ok()?;
    Some(PeerId(ed.to_bytes()))
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Commands sent *into* the swarm task.
#[derive(Debug)]
pub enum SwarmCommand {
    Request {
        peer: libp2p::PeerId,
        envelope: Envelope,
        reply: oneshot::Sender<Reply>,
    },
    /// Answer an inbound request once the local handler is done.
    Respond {
        channel: ResponseChannel<Option<Envelope>>,
        response: Option<Envelope>,
    },
    Dial(Multiaddr),
    GetPeers(oneshot::Sender<Vec<PeerId>>),
    Shutdown,
}

pub struct SwarmConfig {
    pub listen_port: u16,
    pub bootstrap: Vec<Multiaddr>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_QUIC_PORT,
            bootstrap: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Network handle
// ---------------------------------------------------------------------------

/// [`Network`] implementation backed by the swarm task.
#[derive(Clone)]
pub struct SwarmNetwork {
    local: PeerId,
    commands: mpsc::Sender<SwarmCommand>,
}

impl SwarmNetwork {
    pub async fn dial(&self, addr: Multiaddr) -> Result<(), NetError> {
        self.commands
            .send(SwarmCommand::Dial(addr))
            .await
            .map_err(|_| NetError::Closed)
    }

    /// Connected peers speaking the loom protocol.
    pub async fn connected_peers(&self) -> Result<Vec<PeerId>, NetError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(SwarmCommand::GetPeers(tx))
            .await
            .map_err(|_| NetError::Closed)?;
        rx.await.map_err(|_| NetError::Closed)
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(SwarmCommand::Shutdown).await;
    }

    async fn exchange(&self, peer: &PeerId, envelope: Envelope) -> Reply {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(SwarmCommand::Request {
                peer: to_libp2p(peer)?,
                envelope,
                reply: tx,
            })
            .await
            .map_err(|_| NetError::Closed)?;
        rx.await.map_err(|_| NetError::Closed)?
    }
}

#[async_trait]
impl Network for SwarmNetwork {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    async fn send(&self, peer: &PeerId, envelope: Envelope) -> Result<(), NetError> {
        let timeout = Duration::from_secs(DIRECT_SEND_TIMEOUT_SECS);
        match tokio::time::timeout(timeout, self.exchange(peer, envelope)).await {
            Ok(reply) => reply.map(|_| ()),
            Err(_) => Err(NetError::Timeout),
        }
    }

    async fn request(&self, peer: &PeerId, envelope: Envelope) -> Result<Envelope, NetError> {
        self.exchange(peer, envelope).await?.ok_or(NetError::NoResponse)
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

/// Spawn the libp2p swarm in a background task.
///
/// Returns the network handle and the stream of inbound envelopes.
pub async fn spawn_swarm(
    identity: &Identity,
    config: SwarmConfig,
) -> anyhow::Result<(SwarmNetwork, mpsc::Receiver<Inbound>)> {
    let mut secret = *identity.secret_bytes();
    let keypair = libp2p::identity::Keypair::ed25519_from_bytes(&mut secret)?;

    let mut swarm = build_swarm(keypair)?;
    let local_peer_id = *swarm.local_peer_id();

    swarm.listen_on(format!("/ip4/0.0.0.0/udp/{}/quic-v1", config.listen_port).parse()?)?;
    swarm.listen_on(format!("/ip6/::/udp/{}/quic-v1", config.listen_port).parse()?)?;

    info!(peer_id = %local_peer_id, port = config.listen_port, "Swarm listening");

    for addr in &config.bootstrap {
        if let Some(peer_id) = extract_peer_id(addr) {
            swarm.behaviour_mut().kademlia.add_address(&peer_id, addr.clone());
        }
        if let Err(e) = swarm.dial(addr.clone()) {
            warn!(addr = %addr, error = %e, "Failed to dial bootstrap peer");
        }
    }
    if !config.bootstrap.is_empty() {
        if let Err(e) = swarm.behaviour_mut().kademlia.bootstrap() {
            warn!(error = %e, "Kademlia bootstrap failed to start");
        }
    }

    let (cmd_tx, mut cmd_rx) = mpsc::channel::<SwarmCommand>(256);
    let (inbound_tx, inbound_rx) = mpsc::channel::<Inbound>(256);
    let responder = cmd_tx.clone();

    tokio::spawn(async move {
        let mut peer_tracker = PeerTracker::new();
        let mut pending: HashMap<OutboundRequestId, oneshot::Sender<Reply>> = HashMap::new();

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SwarmCommand::Request { peer, envelope, reply }) => {
                            let id = swarm.behaviour_mut().rpc.send_request(&peer, envelope);
                            pending.insert(id, reply);
                        }
                        Some(SwarmCommand::Respond { channel, response }) => {
                            if swarm.behaviour_mut().rpc.send_response(channel, response).is_err() {
                                debug!("Response channel closed before reply was sent");
                            }
                        }
                        Some(SwarmCommand::Dial(addr)) => {
                            if let Err(e) = swarm.dial(addr.clone()) {
                                error!(addr = %addr, error = %e, "Dial failed");
                            }
                        }
                        Some(SwarmCommand::GetPeers(reply)) => {
                            let _ = reply.send(peer_tracker.loom_peers());
                        }
                        Some(SwarmCommand::Shutdown) => {
                            info!("Swarm shutdown requested");
                            break;
                        }
                        None => {
                            info!("Command channel closed, shutting down swarm");
                            break;
                        }
                    }
                }

                event = swarm.select_next_some() => {
                    match event {
                        SwarmEvent::Behaviour(LoomEvent::Rpc(request_response::Event::Message {
                            peer,
                            message,
                            ..
                        })) => match message {
                            request_response::Message::Request { request, channel, .. } => {
                                let Some(from) = from_libp2p(&peer) else {
                                    warn!(peer = %peer, "Request from non-ed25519 peer dropped");
                                    continue;
                                };
                                if request.signer != from {
                                    warn!(peer = %peer, "Envelope signer does not match connection");
                                    continue;
                                }

                                let (reply_tx, reply_rx) = oneshot::channel();
                                let inbound = Inbound { from, envelope: request, reply: reply_tx };
                                if inbound_tx.send(inbound).await.is_err() {
                                    warn!("Inbound receiver dropped, ignoring request");
                                    continue;
                                }

                                let responder = responder.clone();
                                tokio::spawn(async move {
                                    let response = reply_rx.await.unwrap_or(None);
                                    let _ = responder
                                        .send(SwarmCommand::Respond { channel, response })
                                        .await;
                                });
                            }
                            request_response::Message::Response { request_id, response } => {
                                if let Some(reply) = pending.remove(&request_id) {
                                    let _ = reply.send(Ok(response));
                                }
                            }
                        },

                        SwarmEvent::Behaviour(LoomEvent::Rpc(
                            request_response::Event::OutboundFailure { peer, request_id, error, .. },
                        )) => {
                            debug!(peer = %peer, error = %error, "Outbound request failed");
                            if let Some(reply) = pending.remove(&request_id) {
                                let err = match error {
                                    OutboundFailure::Timeout => NetError::Timeout,
                                    OutboundFailure::ConnectionClosed => NetError::NoResponse,
                                    other => NetError::Unreachable(other.to_string()),
                                };
                                let _ = reply.send(Err(err));
                            }
                        }

                        SwarmEvent::Behaviour(LoomEvent::Rpc(
                            request_response::Event::InboundFailure { peer, error, .. },
                        )) => {
                            debug!(peer = %peer, error = %error, "Inbound request failed");
                        }

                        SwarmEvent::Behaviour(LoomEvent::Kademlia(
                            kad::Event::OutboundQueryProgressed { result, .. },
                        )) => {
                            debug!(result = ?result, "Kademlia query progressed");
                        }

                        SwarmEvent::Behaviour(LoomEvent::Identify(
                            identify::Event::Received { peer_id, info, .. },
                        )) => {
                            debug!(peer = %peer_id, protocol = %info.protocol_version, "Identify: received info");
                            peer_tracker.on_identified(&peer_id, &info.protocol_version);
                            for addr in &info.listen_addrs {
                                swarm.behaviour_mut().kademlia.add_address(&peer_id, addr.clone());
                            }
                        }

                        SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                            let addr = endpoint.get_remote_address().clone();
                            info!(peer = %peer_id, addr = %addr, "Peer connected");
                            peer_tracker.on_connected(peer_id, addr);
                        }

                        SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                            if num_established == 0 {
                                peer_tracker.on_disconnected(&peer_id);
                                info!(peer = %peer_id, "Peer disconnected");
                            }
                        }

                        SwarmEvent::NewListenAddr { address, .. } => {
                            info!(addr = %address, "Listening on new address");
                        }

                        SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                            warn!(peer = ?peer_id, error = %error, "Outgoing connection error");
                        }

                        _ => {}
                    }
                }
            }
        }

        for (_, reply) in pending.drain() {
            let _ = reply.send(Err(NetError::Closed));
        }
        info!("Swarm event loop terminated");
    });

    let network = SwarmNetwork {
        local: identity.peer_id(),
        commands: cmd_tx,
    };
    Ok((network, inbound_rx))
}
