use std::sync::Arc;

use chrono::{Duration, Utc};
use rand::RngCore;
use tracing::{debug, info, warn};

use loom_shared::constants::{
    ACCESS_TOKEN_TTL_SECS, CAFE_API_VERSION, CAFE_PAGE_SIZE, CAFE_PROTOCOL, REFRESH_TOKEN_TTL_SECS,
};
use loom_shared::identity::verify_signature_bytes;
use loom_shared::protocol::{
    Cafe, CafeChallenge, CafeDeleteMessagesAck, CafeDeliverMessage, CafeInboxMessage, CafeMessages,
    CafeNonce, CafeObjectList, CafeRefreshSession, CafeRegistration, CafeSession, CafeStored,
    Envelope, Payload,
};
use loom_shared::session::{self, TOKEN_TYPE};
use loom_shared::types::{Address, ContentId, PeerId, ThreadId};
use loom_shared::{Account, Identity};
use loom_store::{
    CafeClient as Client, CafeClientMessage, CafeClientNonce, CafeClientThread, CafeToken,
    Datastore, StoreError,
};

use crate::content::ContentStore;
use crate::error::{NodeError, Result};

#[derive(Debug, Clone)]
pub struct CafeHostConfig {
    /// Accept registrations without a dev token
    pub open: bool,
    /// Public base URL of the HTTP binding, empty if none
    pub url: String,
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
}

impl Default for CafeHostConfig {
    fn default() -> Self {
        Self {
            open: false,
            url: String::new(),
            access_ttl: Duration::seconds(ACCESS_TOKEN_TTL_SECS),
            refresh_ttl: Duration::seconds(REFRESH_TOKEN_TTL_SECS),
        }
    }
}

impl CafeHostConfig {
    pub fn open_registration() -> Self {
        Self {
            open: true,
            ..Self::default()
        }
    }
}

/// Serves cafe requests: registration, sessions, object pinning, thread
/// backups and client inboxes.
pub struct CafeHost {
    identity: Identity,
    account: Account,
    datastore: Datastore,
    content: Arc<dyn ContentStore>,
    config: CafeHostConfig,
}

impl CafeHost {
    pub fn new(
        identity: Identity,
        account: Account,
        datastore: Datastore,
        content: Arc<dyn ContentStore>,
        config: CafeHostConfig,
    ) -> Self {
        Self {
            identity,
            account,
            datastore,
            content,
            config,
        }
    }

    pub fn config(&self) -> &CafeHostConfig {
        &self.config
    }

    pub fn info(&self) -> Cafe {
        Cafe {
            peer: self.identity.peer_id(),
            address: self.account.address(),
            api: CAFE_API_VERSION.to_string(),
            protocol: CAFE_PROTOCOL.to_string(),
            node: env!("CARGO_PKG_VERSION").to_string(),
            url: self.config.url.clone(),
        }
    }

    /// Answer a cafe request envelope from `from`.
    ///
    /// Failures become protocol ERROR responses; fire-and-forget requests
    /// get no answer either way.
    pub async fn handle(&self, from: &PeerId, envelope: &Envelope) -> Option<Envelope> {
        let request_id = envelope.message.request_id;
        let kind = envelope.payload().kind();

        let result = self.dispatch(from, envelope.payload()).await;
        let response = match result {
            Ok(None) => return None,
            Ok(Some(payload)) => Envelope::new(&self.identity, payload, request_id, true),
            Err(e) => {
                if e.status_code() >= 500 {
                    warn!(peer = %from.short(), request = kind, error = %e, "cafe request failed");
                } else {
                    debug!(peer = %from.short(), request = kind, error = %e, "cafe request rejected");
                }
                request_id?;
                Envelope::new(&self.identity, error_payload(&e), request_id, true)
            }
        };

        response
            .inspect_err(|e| warn!(error = %e, "could not sign cafe response"))
            .ok()
    }

    async fn dispatch(&self, from: &PeerId, payload: &Payload) -> Result<Option<Payload>> {
        let response = match payload {
            Payload::CafeChallenge(req) => Payload::CafeNonce(self.challenge(req)?),
            Payload::CafeRegistration(req) => Payload::CafeSession(self.register(from, req)?),
            Payload::CafeRefreshSession(req) => Payload::CafeSession(self.refresh(from, req)?),
            Payload::CafeStore(req) => {
                let client = self.authorize(&req.token, Some(from))?;
                Payload::CafeObjectList(self.store(&client, &req.cids).await?)
            }
            Payload::CafeObject(req) => {
                let client = self.authorize(&req.token, Some(from))?;
                let id = self.store_object(&client, &req.cid, &req.data).await?;
                Payload::CafeStored(CafeStored { id: id.to_string() })
            }
            Payload::CafeStoreThread(req) => {
                let client = self.authorize(&req.token, Some(from))?;
                self.store_thread(&client, &req.id, &req.ciphertext)?;
                Payload::CafeStored(CafeStored { id: req.id.to_hex() })
            }
            Payload::CafeUnstoreThread(req) => {
                let client = self.authorize(&req.token, Some(from))?;
                self.unstore_thread(&client, &req.id)?;
                Payload::CafeStored(CafeStored { id: req.id.to_hex() })
            }
            Payload::CafeCheckMessages(req) => {
                let client = self.authorize(&req.token, Some(from))?;
                Payload::CafeMessages(self.check_messages(&client)?)
            }
            Payload::CafeDeleteMessages(req) => {
                let client = self.authorize(&req.token, Some(from))?;
                Payload::CafeDeleteMessagesAck(self.delete_messages(&client, req.cursor)?)
            }
            other => return Err(NodeError::UnexpectedPayload(other.kind())),
        };
        Ok(Some(response))
    }

    // ------------------------------------------------------------------
    // Registration and sessions
    // ------------------------------------------------------------------

    pub fn challenge(&self, req: &CafeChallenge) -> Result<CafeNonce> {
        let address = Address::parse(&req.address)?;
        let nonce = CafeClientNonce {
            value: uuid::Uuid::new_v4().simple().to_string(),
            address,
            date: Utc::now(),
        };
        self.datastore.with(|db| db.add_cafe_client_nonce(&nonce))?;
        Ok(CafeNonce { value: nonce.value })
    }

    pub fn register(&self, from: &PeerId, req: &CafeRegistration) -> Result<CafeSession> {
        if !self.config.open {
            let known = self
                .datastore
                .with(|db| db.has_cafe_token_hash(&token_hash(&req.token)))?;
            if !known {
                return Err(NodeError::Forbidden);
            }
        }

        let address = Address::parse(&req.address)?;
        let nonce = match self.datastore.with(|db| db.get_cafe_client_nonce(&req.value)) {
            Ok(nonce) => nonce,
            Err(StoreError::NotFound) => {
                return Err(NodeError::BadRequest("challenge not found".to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        if nonce.address != address {
            return Err(NodeError::Forbidden);
        }

        let signed = format!("{}{}", req.value, req.nonce);
        verify_signature_bytes(address.public_key_bytes(), signed.as_bytes(), &req.sig)
            .map_err(|_| NodeError::Forbidden)?;

        let now = Utc::now();
        let client = Client {
            id: *from,
            address,
            created_at: now,
            last_seen: now,
        };
        self.datastore.with(|db| {
            db.delete_cafe_client_nonce(&req.value)?;
            db.add_or_update_cafe_client(&client)
        })?;

        info!(client = %from.short(), address = %address, "client registered");
        Ok(self.new_session(from))
    }

    /// Issue a fresh session for a live refresh token paired with its
    /// access token.
    pub fn refresh(&self, from: &PeerId, req: &CafeRefreshSession) -> Result<CafeSession> {
        session::validate_refresh(
            &req.access,
            &req.refresh,
            &self.identity.public_key_bytes(),
            CAFE_PROTOCOL,
            from,
        )?;
        self.client(from)?;
        debug!(client = %from.short(), "session refreshed");
        Ok(self.new_session(from))
    }

    fn new_session(&self, subject: &PeerId) -> CafeSession {
        let tokens = session::issue(
            &self.identity,
            subject,
            CAFE_PROTOCOL,
            self.config.access_ttl,
            self.config.refresh_ttl,
        );
        CafeSession {
            id: self.identity.peer_id(),
            access: tokens.access,
            exp: tokens.access_expiry,
            refresh: tokens.refresh,
            rexp: tokens.refresh_expiry,
            subject: *subject,
            token_type: TOKEN_TYPE.to_string(),
            cafe: self.info(),
        }
    }

    /// Check an access token and return the registered client it names.
    ///
    /// With `subject`, the token must have been issued to that peer.
    pub fn authorize(&self, token: &str, subject: Option<&PeerId>) -> Result<Client> {
        let claims = session::validate(
            token,
            &self.identity.public_key_bytes(),
            false,
            CAFE_PROTOCOL,
            subject,
        )?;
        let client = self.client(&claims.subject)?;
        self.datastore
            .with(|db| db.update_cafe_client_last_seen(&client.id, &Utc::now()))?;
        Ok(client)
    }

    fn client(&self, id: &PeerId) -> Result<Client> {
        self.datastore
            .with(|db| db.get_cafe_client(id))
            .map_err(|e| match e {
                StoreError::NotFound => NodeError::Forbidden,
                other => other.into(),
            })
    }

    // ------------------------------------------------------------------
    // Objects and thread backups
    // ------------------------------------------------------------------

    /// Pin what we already hold and list what the client must push.
    pub async fn store(&self, client: &Client, cids: &[ContentId]) -> Result<CafeObjectList> {
        let mut needed = Vec::new();
        for cid in cids {
            if self.content.has(cid).await? {
                self.content.pin(cid).await?;
                self.hold(client, cid)?;
            } else {
                needed.push(cid.clone());
            }
        }
        debug!(client = %client.id.short(), requested = cids.len(), needed = needed.len(), "store request");
        Ok(CafeObjectList { cids: needed })
    }

    pub async fn store_object(&self, client: &Client, cid: &ContentId, data: &[u8]) -> Result<ContentId> {
        if !cid.matches(data) {
            return Err(NodeError::BadRequest(format!("object does not match {}", cid.short())));
        }
        let id = self.content.add(data).await?;
        self.hold(client, &id)?;
        debug!(client = %client.id.short(), object = %id.short(), size = data.len(), "pinned object");
        Ok(id)
    }

    /// Pin raw bytes under whatever id they hash to.
    pub async fn pin(&self, client: &Client, data: &[u8]) -> Result<ContentId> {
        let id = self.content.add(data).await?;
        self.hold(client, &id)?;
        debug!(client = %client.id.short(), object = %id.short(), size = data.len(), "pinned upload");
        Ok(id)
    }

    /// Release the client's pin. The object itself is unpinned once no
    /// client holds it.
    pub async fn unpin(&self, client: &Client, cid: &ContentId) -> Result<()> {
        if !self
            .datastore
            .with(|db| db.delete_cafe_client_pin(cid, &client.id))?
        {
            debug!(client = %client.id.short(), object = %cid.short(), "unpin of object not held");
            return Ok(());
        }
        if self.datastore.with(|db| db.count_cafe_client_pins(cid))? == 0 {
            self.content.unpin(cid).await?;
        }
        debug!(client = %client.id.short(), object = %cid.short(), "unpinned object");
        Ok(())
    }

    fn hold(&self, client: &Client, cid: &ContentId) -> Result<()> {
        Ok(self.datastore.with(|db| db.add_cafe_client_pin(cid, &client.id))?)
    }

    pub fn store_thread(&self, client: &Client, id: &ThreadId, ciphertext: &[u8]) -> Result<()> {
        let thread = CafeClientThread {
            id: *id,
            client_id: client.id,
            ciphertext: ciphertext.to_vec(),
            updated_at: Utc::now(),
        };
        self.datastore
            .with(|db| db.add_or_update_cafe_client_thread(&thread))?;
        debug!(client = %client.id.short(), thread = %id.short(), "stored thread backup");
        Ok(())
    }

    pub fn unstore_thread(&self, client: &Client, id: &ThreadId) -> Result<()> {
        self.datastore
            .with(|db| db.delete_cafe_client_thread(id, &client.id))?;
        debug!(client = %client.id.short(), thread = %id.short(), "removed thread backup");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inboxes
    // ------------------------------------------------------------------

    /// Park a sealed envelope from `from` for a registered client.
    pub fn deliver(&self, from: &PeerId, req: &CafeDeliverMessage) -> Result<()> {
        self.client(&req.client)
            .map_err(|_| NodeError::ContactNotFound(req.client.short()))?;
        if !req.id.matches(&req.env) {
            return Err(NodeError::BadRequest(format!("message does not match {}", req.id.short())));
        }

        let msg = CafeClientMessage {
            seq: 0,
            id: req.id.clone(),
            peer: *from,
            client_id: req.client,
            envelope: req.env.clone(),
            date: Utc::now(),
        };
        self.datastore
            .with(|db| db.add_or_update_cafe_client_message(&msg))?;
        debug!(from = %from.short(), client = %req.client.short(), message = %req.id.short(), "inbox message stored");
        Ok(())
    }

    /// The oldest page of a client's inbox. An empty page has cursor 0.
    pub fn check_messages(&self, client: &Client) -> Result<CafeMessages> {
        let page = self
            .datastore
            .with(|db| db.list_cafe_client_messages(&client.id, CAFE_PAGE_SIZE))?;
        let cursor = page.last().map_or(0, |m| m.seq);
        let messages = page
            .into_iter()
            .map(|m| CafeInboxMessage {
                id: m.id,
                peer: m.peer,
                date: m.date,
                env: m.envelope,
            })
            .collect();
        Ok(CafeMessages { messages, cursor })
    }

    /// Drop messages the client has seen, up to `cursor`.
    pub fn delete_messages(&self, client: &Client, cursor: i64) -> Result<CafeDeleteMessagesAck> {
        let remaining = self
            .datastore
            .with(|db| db.delete_cafe_client_messages(&client.id, cursor))?;
        Ok(CafeDeleteMessagesAck { more: remaining > 0 })
    }

    // ------------------------------------------------------------------
    // Dev tokens
    // ------------------------------------------------------------------

    /// Create a dev token. The plaintext is returned once; only its hash
    /// is kept.
    pub fn create_token(&self) -> Result<(CafeToken, String)> {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        let plaintext = hex::encode(raw);

        let token = CafeToken {
            id: uuid::Uuid::new_v4().to_string(),
            token_hash: token_hash(&plaintext),
            created_at: Utc::now(),
        };
        self.datastore.with(|db| db.add_cafe_token(&token))?;
        info!(id = %token.id, "dev token created");
        Ok((token, plaintext))
    }

    pub fn list_tokens(&self) -> Result<Vec<CafeToken>> {
        Ok(self.datastore.with(|db| db.list_cafe_tokens())?)
    }

    pub fn revoke_token(&self, id: &str) -> Result<bool> {
        let removed = self.datastore.with(|db| db.delete_cafe_token(id))?;
        if removed {
            info!(id = %id, "dev token revoked");
        }
        Ok(removed)
    }
}

fn token_hash(token: &str) -> String {
    blake3::hash(token.as_bytes()).to_hex().to_string()
}

fn error_payload(err: &NodeError) -> Payload {
    Payload::Error(loom_shared::protocol::ErrorMessage {
        code: err.status_code(),
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use loom_shared::protocol::CafeInboxMessage;

    use super::*;
    use crate::content::MemoryContentStore;

    fn host(open: bool) -> CafeHost {
        let config = CafeHostConfig {
            open,
            ..CafeHostConfig::default()
        };
        CafeHost::new(
            Identity::generate(),
            Account::generate(),
            Datastore::in_memory().unwrap(),
            Arc::new(MemoryContentStore::new()),
            config,
        )
    }

    fn registration(host: &CafeHost, account: &Account, token: &str) -> CafeRegistration {
        let nonce = host
            .challenge(&CafeChallenge {
                address: account.address().to_string(),
            })
            .unwrap();
        let own = "abc".to_string();
        let sig = account.sign(format!("{}{}", nonce.value, own).as_bytes());
        CafeRegistration {
            address: account.address().to_string(),
            value: nonce.value,
            nonce: own,
            sig: sig.to_bytes().to_vec(),
            token: token.to_string(),
        }
    }

    #[test]
    fn test_challenge_rejects_seed() {
        let host = host(true);
        let seed = Account::generate().seed();
        assert!(matches!(
            host.challenge(&CafeChallenge { address: seed }),
            Err(NodeError::Identity(_))
        ));
    }

    #[test]
    fn test_registration_checks_signature_and_nonce() {
        let host = host(true);
        let peer = Identity::generate().peer_id();
        let account = Account::generate();

        let mut forged = registration(&host, &account, "");
        forged.sig = Account::generate()
            .sign(format!("{}{}", forged.value, forged.nonce).as_bytes())
            .to_bytes()
            .to_vec();
        assert!(matches!(host.register(&peer, &forged), Err(NodeError::Forbidden)));

        let req = registration(&host, &account, "");
        let session = host.register(&peer, &req).unwrap();
        assert_eq!(session.subject, peer);
        assert!(host.authorize(&session.access, Some(&peer)).is_ok());

        // nonces are single use
        assert!(matches!(host.register(&peer, &req), Err(NodeError::BadRequest(_))));
    }

    #[test]
    fn test_refresh_token_is_not_an_access_token() {
        let host = host(true);
        let peer = Identity::generate().peer_id();
        let session = host
            .register(&peer, &registration(&host, &Account::generate(), ""))
            .unwrap();

        assert!(matches!(
            host.authorize(&session.refresh, Some(&peer)),
            Err(NodeError::Forbidden)
        ));
        assert!(matches!(host.authorize("", Some(&peer)), Err(NodeError::Unauthorized)));

        let renewed = host
            .refresh(
                &peer,
                &CafeRefreshSession {
                    access: session.access,
                    refresh: session.refresh,
                },
            )
            .unwrap();
        assert!(host.authorize(&renewed.access, Some(&peer)).is_ok());
    }

    #[test]
    fn test_inbox_pages() {
        let host = host(true);
        let peer = Identity::generate().peer_id();
        host.register(&peer, &registration(&host, &Account::generate(), ""))
            .unwrap();
        let client = host.client(&peer).unwrap();
        let sender = Identity::generate().peer_id();

        for i in 0..(CAFE_PAGE_SIZE + 3) {
            let env = format!("sealed {i}").into_bytes();
            host.deliver(
                &sender,
                &CafeDeliverMessage {
                    id: ContentId::of(&env),
                    client: peer,
                    env,
                },
            )
            .unwrap();
        }

        let first = host.check_messages(&client).unwrap();
        assert_eq!(first.messages.len(), CAFE_PAGE_SIZE);
        assert!(first.messages.iter().all(|m| m.peer == sender));
        assert!(host.delete_messages(&client, first.cursor).unwrap().more);
        let second = host.check_messages(&client).unwrap();
        assert_eq!(second.messages.len(), 3);
        assert!(!host.delete_messages(&client, second.cursor).unwrap().more);
    }

    #[test]
    fn test_inbox_delete_spares_unseen_messages() {
        let host = host(true);
        let peer = Identity::generate().peer_id();
        host.register(&peer, &registration(&host, &Account::generate(), ""))
            .unwrap();
        let client = host.client(&peer).unwrap();
        let sender = Identity::generate().peer_id();
        let deliver = |i: usize| {
            let env = format!("sealed {i}").into_bytes();
            host.deliver(
                &sender,
                &CafeDeliverMessage {
                    id: ContentId::of(&env),
                    client: peer,
                    env,
                },
            )
            .unwrap();
        };

        deliver(0);
        deliver(1);
        let seen = host.check_messages(&client).unwrap();
        assert_eq!(seen.messages.len(), 2);
        deliver(2);

        assert!(host.delete_messages(&client, seen.cursor).unwrap().more);
        let rest: Vec<CafeInboxMessage> = host.check_messages(&client).unwrap().messages;
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].env, b"sealed 2".to_vec());
    }

    #[test]
    fn test_deliver_to_unknown_client_fails() {
        let host = host(true);
        let env = b"sealed".to_vec();
        let res = host.deliver(
            &Identity::generate().peer_id(),
            &CafeDeliverMessage {
                id: ContentId::of(&env),
                client: Identity::generate().peer_id(),
                env,
            },
        );
        assert!(matches!(res, Err(NodeError::ContactNotFound(_))));
    }

    #[tokio::test]
    async fn test_store_lists_missing_objects() {
        let host = host(true);
        let peer = Identity::generate().peer_id();
        host.register(&peer, &registration(&host, &Account::generate(), ""))
            .unwrap();
        let client = host.client(&peer).unwrap();

        let held = host.content.put(b"held").await.unwrap();
        let missing = ContentId::of(b"missing");
        let list = host.store(&client, &[held.clone(), missing.clone()]).await.unwrap();
        assert_eq!(list.cids, vec![missing.clone()]);
        assert!(host.content.is_pinned(&held).await.unwrap());

        assert!(host.store_object(&client, &missing, b"other bytes").await.is_err());
        host.store_object(&client, &missing, b"missing").await.unwrap();
        assert!(host.content.is_pinned(&missing).await.unwrap());
    }

    #[tokio::test]
    async fn test_unpin_waits_for_every_holder() {
        let host = host(true);
        let mut clients = Vec::new();
        for _ in 0..3 {
            let peer = Identity::generate().peer_id();
            host.register(&peer, &registration(&host, &Account::generate(), ""))
                .unwrap();
            clients.push(host.client(&peer).unwrap());
        }
        let (a, b, stranger) = (&clients[0], &clients[1], &clients[2]);

        let id = host.pin(a, b"shared object").await.unwrap();
        host.store_object(b, &id, b"shared object").await.unwrap();

        host.unpin(stranger, &id).await.unwrap();
        host.unpin(a, &id).await.unwrap();
        assert!(host.content.is_pinned(&id).await.unwrap());

        host.unpin(b, &id).await.unwrap();
        assert!(!host.content.is_pinned(&id).await.unwrap());
    }
}
