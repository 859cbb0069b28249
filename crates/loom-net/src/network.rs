//! The transport contract the node is written against.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;

use loom_shared::protocol::Envelope;
use loom_shared::types::PeerId;
use loom_shared::ProtocolError;

#[derive(Error, Debug)]
pub enum NetError {
    #[error("Peer {0} is unreachable")]
    Unreachable(String),

    #[error("Local node is offline")]
    Offline,

    #[error("Request timed out")]
    Timeout,

    #[error("Peer closed the request without answering")]
    NoResponse,

    #[error("Network task has shut down")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for NetError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            NetError::Timeout
        } else if e.is_connect() {
            NetError::Unreachable(e.to_string())
        } else {
            NetError::Http(e.to_string())
        }
    }
}

/// An envelope received from a remote peer.
///
/// The handler must answer through `reply`: `None` acknowledges a
/// fire-and-forget message, `Some` carries the response to a request.
#[derive(Debug)]
pub struct Inbound {
    pub from: PeerId,
    pub envelope: Envelope,
    pub reply: oneshot::Sender<Option<Envelope>>,
}

/// Signed envelope exchange with other peers.
#[async_trait]
pub trait Network: Send + Sync {
    fn local_peer(&self) -> PeerId;

    fn is_online(&self) -> bool {
        true
    }

    /// Deliver an envelope and wait for the remote handler to accept it.
    async fn send(&self, peer: &PeerId, envelope: Envelope) -> Result<(), NetError>;

    /// Send a request and wait for its response envelope.
    async fn request(&self, peer: &PeerId, envelope: Envelope) -> Result<Envelope, NetError>;
}
