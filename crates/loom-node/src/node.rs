//! The node aggregate.
//!
//! [`Node::new`] wires every component in dependency order: peer service,
//! cafe client, cafe outbox, block outbox, threads, cafe inbox. Nothing
//! runs until [`Node::spawn_dispatch`] and [`Node::spawn_ticker`] are
//! called.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use loom_net::{Inbound, Network};
use loom_shared::protocol::{CafeDeliverMessage, CafeSession, ContentResponse, Envelope, Payload, Peer};
use loom_shared::types::PeerId;
use loom_shared::{Account, Identity};
use loom_store::Datastore;

use crate::cafe::{CafeClient, CafeHost, CafeHostConfig};
use crate::content::ContentStore;
use crate::error::{NodeError, Result};
use crate::queue::{BlockOutbox, CafeInbox, CafeOutbox};
use crate::service::PeerService;
use crate::thread::ThreadContext;
use crate::threads::Threads;

#[derive(Debug, Clone, Default)]
pub struct NodeOptions {
    /// Display name carried in the contact card
    pub name: String,
    /// Serve cafe requests with this configuration
    pub cafe_host: Option<CafeHostConfig>,
}

pub struct Node {
    identity: Identity,
    account: Account,
    datastore: Datastore,
    content: Arc<dyn ContentStore>,
    service: Arc<PeerService>,
    cafe_client: Arc<CafeClient>,
    cafe_outbox: Arc<CafeOutbox>,
    block_outbox: Arc<BlockOutbox>,
    threads: Arc<Threads>,
    cafe_inbox: Arc<CafeInbox>,
    cafe_host: Option<Arc<CafeHost>>,
}

impl Node {
    pub fn new(
        identity: Identity,
        account: Account,
        datastore: Datastore,
        content: Arc<dyn ContentStore>,
        network: Arc<dyn Network>,
        options: NodeOptions,
    ) -> Result<Arc<Self>> {
        let service = Arc::new(PeerService::new(identity.clone(), account.clone(), network));

        // known cafes stay reachable over HTTP across restarts
        for session in datastore.with(|db| db.list_cafe_sessions())? {
            service.learn_cafe(&session.cafe);
        }

        let cafe_client = Arc::new(CafeClient::new(
            account.clone(),
            datastore.clone(),
            content.clone(),
            service.clone(),
        ));
        let cafe_outbox = Arc::new(CafeOutbox::new(
            identity.peer_id(),
            datastore.clone(),
            content.clone(),
            cafe_client.clone(),
        ));
        let block_outbox = Arc::new(BlockOutbox::new(
            datastore.clone(),
            service.clone(),
            cafe_outbox.clone(),
        ));

        let ctx = Arc::new(ThreadContext {
            identity: identity.clone(),
            account: account.clone(),
            name: options.name.clone(),
            datastore: datastore.clone(),
            content: content.clone(),
            service: service.clone(),
            block_outbox: block_outbox.clone(),
            cafe_outbox: cafe_outbox.clone(),
        });
        let threads = Arc::new(Threads::new(ctx)?);

        let cafe_inbox = Arc::new(CafeInbox::new(
            identity.clone(),
            datastore.clone(),
            content.clone(),
            cafe_client.clone(),
            threads.clone(),
        ));

        let cafe_host = options.cafe_host.map(|config| {
            Arc::new(CafeHost::new(
                identity.clone(),
                account.clone(),
                datastore.clone(),
                content.clone(),
                config,
            ))
        });

        info!(
            peer = %identity.peer_id().short(),
            address = %account.address(),
            threads = threads.list().len(),
            cafe_host = cafe_host.is_some(),
            "node ready"
        );

        Ok(Arc::new(Self {
            identity,
            account,
            datastore,
            content,
            service,
            cafe_client,
            cafe_outbox,
            block_outbox,
            threads,
            cafe_inbox,
            cafe_host,
        }))
    }

    pub fn peer_id(&self) -> PeerId {
        self.identity.peer_id()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn datastore(&self) -> &Datastore {
        &self.datastore
    }

    pub fn content(&self) -> &Arc<dyn ContentStore> {
        &self.content
    }

    pub fn service(&self) -> &Arc<PeerService> {
        &self.service
    }

    pub fn threads(&self) -> &Arc<Threads> {
        &self.threads
    }

    pub fn cafe_client(&self) -> &Arc<CafeClient> {
        &self.cafe_client
    }

    pub fn cafe_outbox(&self) -> &Arc<CafeOutbox> {
        &self.cafe_outbox
    }

    pub fn block_outbox(&self) -> &Arc<BlockOutbox> {
        &self.block_outbox
    }

    pub fn cafe_inbox(&self) -> &Arc<CafeInbox> {
        &self.cafe_inbox
    }

    pub fn cafe_host(&self) -> Option<&Arc<CafeHost>> {
        self.cafe_host.as_ref()
    }

    // ------------------------------------------------------------------
    // Contacts and cafes
    // ------------------------------------------------------------------

    pub fn contact(&self) -> Result<Peer> {
        self.threads.context().contact()
    }

    /// Save a contact card. Older cards than the one held are ignored.
    pub fn add_contact(&self, peer: &Peer) -> Result<()> {
        if peer.id == self.peer_id() {
            return Err(NodeError::BadRequest("cannot add self as contact".to_string()));
        }
        if self.datastore.with(|db| db.add_or_update_peer(peer))? {
            debug!(peer = %peer.id.short(), name = %peer.name, "contact saved");
        }
        for cafe in &peer.inboxes {
            self.service.learn_cafe(cafe);
        }
        Ok(())
    }

    /// Register with a cafe and tell every thread about the new inbox.
    pub async fn register_cafe(&self, cafe: &PeerId, token: &str) -> Result<CafeSession> {
        let session = self.cafe_client.register(cafe, token).await?;
        self.threads.announce_all().await;
        Ok(session)
    }

    pub async fn deregister_cafe(&self, cafe: &PeerId) -> Result<()> {
        self.cafe_client.deregister(cafe)?;
        self.threads.announce_all().await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Background work
    // ------------------------------------------------------------------

    /// Drain every queue once: cafe requests first, so held block messages
    /// can follow in the same pass.
    pub async fn flush(&self) {
        if let Err(e) = self.cafe_outbox.flush().await {
            warn!(error = %e, "cafe outbox flush failed");
        }
        if let Err(e) = self.block_outbox.flush().await {
            warn!(error = %e, "block outbox flush failed");
        }
        if let Err(e) = self.cafe_inbox.flush().await {
            warn!(error = %e, "cafe inbox flush failed");
        }
    }

    /// One ticker round: flush, then poll our cafe inboxes.
    pub async fn tick(&self) {
        self.flush().await;
        if let Err(e) = self.cafe_inbox.check_messages().await {
            warn!(error = %e, "inbox check failed");
        }
    }

    pub fn spawn_ticker(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                node.tick().await;
            }
        })
    }

    /// Answer inbound traffic, one task per envelope.
    pub fn spawn_dispatch(self: &Arc<Self>, mut inbound: mpsc::Receiver<Inbound>) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                let node = node.clone();
                tokio::spawn(async move {
                    let reply = node.handle_message(&msg.from, &msg.envelope).await;
                    let _ = msg.reply.send(reply);
                });
            }
            debug!("inbound channel closed");
        })
    }

    /// Handle one inbound envelope, returning the response to send back.
    pub async fn handle_message(&self, from: &PeerId, envelope: &Envelope) -> Option<Envelope> {
        if let Err(e) = self.service.verify_envelope(envelope, from) {
            warn!(peer = %from.short(), error = %e, "dropping unverified envelope");
            return None;
        }
        let request_id = envelope.message.request_id;

        match envelope.payload() {
            Payload::Ping => self.respond(Payload::Pong, request_id),
            Payload::ThreadEnvelope(env) => {
                match self.threads.handle_envelope(from, env).await {
                    Ok(id) => debug!(peer = %from.short(), block = %id.short(), "handled thread envelope"),
                    Err(e) if e.is_benign() => debug!(peer = %from.short(), reason = %e, "thread envelope ignored"),
                    Err(e) => warn!(peer = %from.short(), thread = %env.thread.short(), error = %e, "thread envelope rejected"),
                }
                None
            }
            Payload::ContentRequest(req) => match self.content.get(&req.id).await {
                Ok(data) => self.respond(
                    Payload::ContentResponse(ContentResponse {
                        id: req.id.clone(),
                        data,
                    }),
                    request_id,
                ),
                Err(e) => self.fail(&NodeError::from(e), request_id),
            },
            Payload::CafeChallenge(_)
            | Payload::CafeRegistration(_)
            | Payload::CafeRefreshSession(_)
            | Payload::CafeStore(_)
            | Payload::CafeObject(_)
            | Payload::CafeStoreThread(_)
            | Payload::CafeUnstoreThread(_)
            | Payload::CafeCheckMessages(_)
            | Payload::CafeDeleteMessages(_) => match &self.cafe_host {
                Some(host) => host.handle(from, envelope).await,
                None => self.fail(&NodeError::BadRequest("not a cafe".to_string()), request_id),
            },
            Payload::CafeDeliverMessage(req) => {
                if let Err(e) = self.deliver_mail(from, req) {
                    debug!(peer = %from.short(), client = %req.client.short(), reason = %e, "inbox delivery rejected");
                }
                None
            }
            Payload::CafeYouHaveMail => {
                self.on_mail(from).await;
                None
            }
            other => {
                debug!(peer = %from.short(), kind = other.kind(), "ignoring unsolicited payload");
                None
            }
        }
    }

    /// Park a message in a client's inbox on this cafe and tell the client,
    /// in case it is online.
    pub fn deliver_mail(&self, from: &PeerId, req: &CafeDeliverMessage) -> Result<()> {
        let host = self
            .cafe_host
            .as_ref()
            .ok_or_else(|| NodeError::BadRequest("not a cafe".to_string()))?;
        host.deliver(from, req)?;

        let client = req.client;
        let service = self.service.clone();
        tokio::spawn(async move {
            let sent = match service.new_envelope(Payload::CafeYouHaveMail) {
                Ok(envelope) => service.send_message(&client, envelope).await,
                Err(e) => Err(e),
            };
            if let Err(e) = sent {
                debug!(client = %client.short(), reason = %e, "client not notified of mail");
            }
        });
        Ok(())
    }

    /// A cafe we hold a session with says our inbox has mail.
    async fn on_mail(&self, cafe: &PeerId) {
        if self.datastore.with(|db| db.get_cafe_session(cafe)).is_err() {
            warn!(cafe = %cafe.short(), "mail notice from unknown cafe");
            return;
        }
        if let Err(e) = self.cafe_inbox.check_messages().await {
            warn!(cafe = %cafe.short(), error = %e, "inbox check failed");
        }
    }

    fn respond(&self, payload: Payload, request_id: Option<u32>) -> Option<Envelope> {
        self.service
            .new_response(payload, request_id)
            .inspect_err(|e| warn!(error = %e, "could not sign response"))
            .ok()
    }

    fn fail(&self, err: &NodeError, request_id: Option<u32>) -> Option<Envelope> {
        request_id?;
        self.service
            .error_response(err, request_id)
            .inspect_err(|e| warn!(error = %e, "could not sign error response"))
            .ok()
    }
}
