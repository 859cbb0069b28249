//! In-process network used by tests and single-process deployments.
//!
//! Every endpoint registered on a [`MemoryHub`] receives its traffic on its
//! own mpsc channel, exactly like the swarm does. Each endpoint carries an
//! online switch so partitions can be simulated.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use loom_shared::constants::{DIRECT_SEND_TIMEOUT_SECS, REQUEST_TIMEOUT_SECS};
use loom_shared::protocol::Envelope;
use loom_shared::types::PeerId;

use crate::network::{Inbound, NetError, Network};

#[derive(Clone)]
struct Endpoint {
    inbox: mpsc::Sender<Inbound>,
    online: Arc<AtomicBool>,
}

/// Shared switchboard connecting [`MemoryNetwork`] endpoints.
#[derive(Clone, Default)]
pub struct MemoryHub {
    endpoints: Arc<Mutex<HashMap<PeerId, Endpoint>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `peer` and return its network handle plus inbound stream.
    pub fn connect(&self, peer: PeerId) -> (MemoryNetwork, mpsc::Receiver<Inbound>) {
        let (tx, rx) = mpsc::channel(256);
        let online = Arc::new(AtomicBool::new(true));

        if let Ok(mut endpoints) = self.endpoints.lock() {
            endpoints.insert(
                peer,
                Endpoint {
                    inbox: tx,
                    online: online.clone(),
                },
            );
        }

        let network = MemoryNetwork {
            hub: self.clone(),
            local: peer,
            online,
        };
        (network, rx)
    }

    fn endpoint(&self, peer: &PeerId) -> Option<Endpoint> {
        self.endpoints.lock().ok()?.get(peer).cloned()
    }
}

/// A peer's view of a [`MemoryHub`].
#[derive(Clone)]
pub struct MemoryNetwork {
    hub: MemoryHub,
    local: PeerId,
    online: Arc<AtomicBool>,
}

impl MemoryNetwork {
    /// Take this peer on or off the network. Offline peers can neither
    /// send nor receive.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    async fn exchange(
        &self,
        peer: &PeerId,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<Option<Envelope>, NetError> {
        if !self.is_online() {
            return Err(NetError::Offline);
        }

        let endpoint = self
            .hub
            .endpoint(peer)
            .filter(|e| e.online.load(Ordering::SeqCst))
            .ok_or_else(|| NetError::Unreachable(peer.short()))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let inbound = Inbound {
            from: self.local,
            envelope,
            reply: reply_tx,
        };
        endpoint
            .inbox
            .send(inbound)
            .await
            .map_err(|_| NetError::Unreachable(peer.short()))?;

        debug!(from = %self.local.short(), to = %peer.short(), "memory envelope queued");

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(NetError::NoResponse),
            Err(_) => Err(NetError::Timeout),
        }
    }
}

#[async_trait]
impl Network for MemoryNetwork {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn send(&self, peer: &PeerId, envelope: Envelope) -> Result<(), NetError> {
        self.exchange(peer, envelope, Duration::from_secs(DIRECT_SEND_TIMEOUT_SECS))
            .await
            .map(|_| ())
    }

    async fn request(&self, peer: &PeerId, envelope: Envelope) -> Result<Envelope, NetError> {
        self.exchange(peer, envelope, Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .await?
            .ok_or(NetError::NoResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_shared::protocol::Payload;
    use loom_shared::Identity;

    fn spawn_echo(mut rx: mpsc::Receiver<Inbound>, identity: Identity) {
        tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                let reply = match inbound.envelope.payload() {
                    Payload::Ping => Envelope::new(&identity, Payload::Pong, None, true).ok(),
                    _ => None,
                };
                let _ = inbound.reply.send(reply);
            }
        });
    }

    #[tokio::test]
    async fn request_reaches_peer_and_returns_reply() {
        let hub = MemoryHub::new();
        let alice = Identity::generate();
        let bob = Identity::generate();

        let (net, _rx) = hub.connect(alice.peer_id());
        let (_bob_net, bob_rx) = hub.connect(bob.peer_id());
        spawn_echo(bob_rx, bob.clone());

        let ping = Envelope::new(&alice, Payload::Ping, Some(1), false).unwrap();
        let pong = net.request(&bob.peer_id(), ping).await.unwrap();
        assert!(matches!(pong.payload(), Payload::Pong));
        assert_eq!(pong.signer, bob.peer_id());
    }

    #[tokio::test]
    async fn offline_peers_are_unreachable() {
        let hub = MemoryHub::new();
        let alice = Identity::generate();
        let bob = Identity::generate();

        let (net, _rx) = hub.connect(alice.peer_id());
        let (bob_net, bob_rx) = hub.connect(bob.peer_id());
        spawn_echo(bob_rx, bob.clone());

        bob_net.set_online(false);
        let ping = Envelope::new(&alice, Payload::Ping, None, false).unwrap();
        let err = net.send(&bob.peer_id(), ping.clone()).await.unwrap_err();
        assert!(matches!(err, NetError::Unreachable(_)));

        bob_net.set_online(true);
        net.set_online(false);
        let err = net.send(&bob.peer_id(), ping.clone()).await.unwrap_err();
        assert!(matches!(err, NetError::Offline));

        net.set_online(true);
        net.send(&bob.peer_id(), ping).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_peer_is_unreachable() {
        let hub = MemoryHub::new();
        let alice = Identity::generate();
        let (net, _rx) = hub.connect(alice.peer_id());

        let ping = Envelope::new(&alice, Payload::Ping, None, false).unwrap();
        let err = net.send(&PeerId([9u8; 32]), ping).await.unwrap_err();
        assert!(matches!(err, NetError::Unreachable(_)));
    }
}
