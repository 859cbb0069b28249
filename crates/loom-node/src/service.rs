//! Signs, routes and verifies envelopes on behalf of the node.
//!
//! Peers are reached through the [`Network`]. Cafes that advertise an HTTP
//! url are reached through [`HttpLink`] instead, carrying the same
//! envelopes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, warn};

use loom_net::{HttpLink, Network};
use loom_shared::constants::{CONTENT_FETCH_TIMEOUT_SECS, DIRECT_SEND_TIMEOUT_SECS};
use loom_shared::identity::verify_signature_bytes;
use loom_shared::protocol::{
    AccountSignature, Cafe, ContentRequest, Envelope, ErrorMessage, Payload, ThreadEnvelope,
};
use loom_shared::types::{ContentId, PeerId, ThreadId};
use loom_shared::{Account, Identity};

use crate::error::{NodeError, Result};

pub struct PeerService {
    identity: Identity,
    account: Account,
    network: Arc<dyn Network>,
    http: Option<HttpLink>,
    /// Cafe peer id to HTTP base url
    routes: RwLock<HashMap<PeerId, String>>,
    next_request: AtomicU32,
}

impl PeerService {
    pub fn new(identity: Identity, account: Account, network: Arc<dyn Network>) -> Self {
        let http = match HttpLink::new() {
            Ok(link) => Some(link),
            Err(e) => {
                warn!(error = %e, "HTTP link unavailable, cafes reachable peer-to-peer only");
                None
            }
        };

        Self {
            identity,
            account,
            network,
            http,
            routes: RwLock::new(HashMap::new()),
            next_request: AtomicU32::new(1),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn is_online(&self) -> bool {
        self.network.is_online()
    }

    /// Reach `peer` over HTTP at `url` from now on.
    pub fn add_route(&self, peer: PeerId, url: &str) {
        if url.is_empty() {
            return;
        }
        if let Ok(mut routes) = self.routes.write() {
            routes.insert(peer, url.trim_end_matches('/').to_string());
        }
    }

    /// Learn the HTTP binding advertised by a cafe.
    pub fn learn_cafe(&self, cafe: &Cafe) {
        self.add_route(cafe.peer, &cafe.url);
    }

    fn route(&self, peer: &PeerId) -> Option<String> {
        self.routes.read().ok()?.get(peer).cloned()
    }

    // ------------------------------------------------------------------
    // Envelopes
    // ------------------------------------------------------------------

    pub fn new_envelope(&self, payload: Payload) -> Result<Envelope> {
        Ok(Envelope::new(&self.identity, payload, None, false)?)
    }

    pub fn new_response(&self, payload: Payload, request_id: Option<u32>) -> Result<Envelope> {
        Ok(Envelope::new(&self.identity, payload, request_id, true)?)
    }

    pub fn error_response(&self, err: &NodeError, request_id: Option<u32>) -> Result<Envelope> {
        self.new_response(
            Payload::Error(ErrorMessage {
                code: err.status_code(),
                message: err.to_string(),
            }),
            request_id,
        )
    }

    /// Wrap a block ciphertext for a thread, optionally countersigned by the
    /// account key.
    pub fn new_thread_envelope(
        &self,
        thread: ThreadId,
        ciphertext: Vec<u8>,
        sign_with_account: bool,
    ) -> Result<Envelope> {
        let account_sig = sign_with_account.then(|| AccountSignature {
            address: self.account.address(),
            sig: self.account.sign(&ciphertext).to_bytes().to_vec(),
        });
        self.new_envelope(Payload::ThreadEnvelope(ThreadEnvelope {
            thread,
            hash: ContentId::of(&ciphertext),
            ciphertext,
            account_sig,
        }))
    }

    pub fn verify_envelope(&self, envelope: &Envelope, claimed: &PeerId) -> Result<()> {
        Ok(envelope.verify(claimed)?)
    }

    /// Check the optional account countersignature of a thread envelope.
    pub fn verify_thread_envelope(&self, env: &ThreadEnvelope) -> Result<()> {
        if !env.hash.matches(&env.ciphertext) {
            return Err(NodeError::InvalidBlock(format!(
                "hash {} does not match ciphertext",
                env.hash.short()
            )));
        }
        if let Some(sig) = &env.account_sig {
            verify_signature_bytes(&sig.address.0, &env.ciphertext, &sig.sig)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Deliver an envelope, bounded by the direct-send grace period.
    pub async fn send_message(&self, peer: &PeerId, envelope: Envelope) -> Result<()> {
        let timeout = Duration::from_secs(DIRECT_SEND_TIMEOUT_SECS);

        if let (Some(url), Some(http)) = (self.route(peer), &self.http) {
            let me = self.peer_id();
            let call = http.post(&url, &me, &envelope);
            tokio::time::timeout(timeout, call)
                .await
                .map_err(|_| NodeError::Timeout)??;
            return Ok(());
        }

        tokio::time::timeout(timeout, self.network.send(peer, envelope))
            .await
            .map_err(|_| NodeError::Timeout)??;
        Ok(())
    }

    /// Send a request and return the verified response envelope.
    ///
    /// Protocol ERROR answers become errors: 401 is [`NodeError::Unauthorized`],
    /// 403 is [`NodeError::Forbidden`].
    pub async fn send_request(&self, peer: &PeerId, payload: Payload) -> Result<Envelope> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let kind = payload.kind();
        let envelope = Envelope::new(&self.identity, payload, Some(request_id), false)?;

        let response = match (self.route(peer), &self.http) {
            (Some(url), Some(http)) => http
                .post(&url, &self.peer_id(), &envelope)
                .await?
                .ok_or(NodeError::Net(loom_net::NetError::NoResponse))?,
            _ => self.network.request(peer, envelope).await?,
        };

        response.verify(peer)?;
        debug!(peer = %peer.short(), request = kind, response = response.payload().kind(), "request answered");

        if let Payload::Error(err) = response.payload() {
            return Err(match err.code {
                401 => NodeError::Unauthorized,
                403 => NodeError::Forbidden,
                code => NodeError::Cafe {
                    code,
                    message: err.message.clone(),
                },
            });
        }
        Ok(response)
    }

    /// Ask `peer` for a blob, checking that it hashes to `id`.
    pub async fn fetch_content(&self, peer: &PeerId, id: &ContentId) -> Result<Vec<u8>> {
        let request = self.send_request(peer, Payload::ContentRequest(ContentRequest { id: id.clone() }));
        let response = tokio::time::timeout(Duration::from_secs(CONTENT_FETCH_TIMEOUT_SECS), request)
            .await
            .map_err(|_| NodeError::Timeout)??;

        match response.message.payload {
            Payload::ContentResponse(res) if res.id == *id && id.matches(&res.data) => Ok(res.data),
            Payload::ContentResponse(_) => Err(NodeError::InvalidBlock(format!(
                "content {} does not match",
                id.short()
            ))),
            other => Err(NodeError::UnexpectedPayload(other.kind())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_net::MemoryHub;

    fn service(hub: &MemoryHub) -> (PeerService, tokio::sync::mpsc::Receiver<loom_net::Inbound>) {
        let identity = Identity::generate();
        let (network, rx) = hub.connect(identity.peer_id());
        (
            PeerService::new(identity, Account::generate(), Arc::new(network)),
            rx,
        )
    }

    #[tokio::test]
    async fn test_thread_envelope_account_signature() {
        let hub = MemoryHub::new();
        let (svc, _rx) = service(&hub);

        let env = svc
            .new_thread_envelope(ThreadId([1u8; 32]), b"ciphertext".to_vec(), true)
            .unwrap();
        let Payload::ThreadEnvelope(mut te) = env.message.payload else {
            panic!("not a thread envelope");
        };
        assert!(svc.verify_thread_envelope(&te).is_ok());

        te.ciphertext = b"tampered".to_vec();
        assert!(svc.verify_thread_envelope(&te).is_err());
    }

    #[tokio::test]
    async fn test_error_answers_map_to_auth_errors() {
        let hub = MemoryHub::new();
        let (client, _crx) = service(&hub);
        let (cafe, mut rx) = service(&hub);
        let cafe = Arc::new(cafe);

        let responder = cafe.clone();
        tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                let id = inbound.envelope.message.request_id;
                let reply = responder.error_response(&NodeError::Unauthorized, id).unwrap();
                let _ = inbound.reply.send(Some(reply));
            }
        });

        let err = client
            .send_request(&cafe.peer_id(), Payload::Ping)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Unauthorized));
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_is_unreachable() {
        let hub = MemoryHub::new();
        let (svc, _rx) = service(&hub);

        let env = svc.new_envelope(Payload::Ping).unwrap();
        let err = svc.send_message(&PeerId([9u8; 32]), env).await.unwrap_err();
        assert!(matches!(err, NodeError::Unreachable(_)));
    }
}
