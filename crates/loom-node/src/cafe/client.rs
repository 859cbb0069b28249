use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use loom_shared::protocol::{
    Cafe, CafeChallenge, CafeCheckMessages, CafeDeleteMessages, CafeDeliverMessage,
    CafeMessages, CafeObject, CafeRefreshSession, CafeRegistration, CafeSession, CafeStore,
    CafeStoreThread, CafeUnstoreThread, Envelope, Payload,
};
use loom_shared::types::{Address, ContentId, PeerId, ThreadId, ThreadSharing, ThreadType};
use loom_shared::Account;
use loom_store::{Datastore, StoreError, ThreadRecord};

use crate::content::{ContentError, ContentStore};
use crate::error::{NodeError, Result};
use crate::service::PeerService;

/// What a cafe keeps of a thread: enough to rejoin it from scratch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadBackup {
    pub id: ThreadId,
    pub key: String,
    pub secret: [u8; 32],
    pub name: String,
    pub head: Vec<ContentId>,
    pub thread_type: ThreadType,
    pub sharing: ThreadSharing,
    pub whitelist: Vec<Address>,
    pub initiator: Address,
    pub schema: Option<ContentId>,
}

impl ThreadBackup {
    pub fn of(record: &ThreadRecord) -> Self {
        Self {
            id: record.id,
            key: record.key.clone(),
            secret: record.secret,
            name: record.name.clone(),
            head: record.head.clone(),
            thread_type: record.thread_type,
            sharing: record.sharing,
            whitelist: record.whitelist.clone(),
            initiator: record.initiator,
            schema: record.schema.clone(),
        }
    }

    /// Sealed to the account key, so only the account holder can restore it.
    pub fn seal(&self, account: &Account) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self).map_err(|e| NodeError::BadRequest(e.to_string()))?;
        Ok(account.seal(&json)?)
    }

    pub fn open(account: &Account, ciphertext: &[u8]) -> Result<Self> {
        let json = account.open(ciphertext)?;
        serde_json::from_slice(&json).map_err(|e| NodeError::BadRequest(e.to_string()))
    }
}

/// Talks to the cafes this node is registered with.
pub struct CafeClient {
    account: Account,
    datastore: Datastore,
    content: Arc<dyn ContentStore>,
    service: Arc<PeerService>,
}

impl CafeClient {
    pub fn new(
        account: Account,
        datastore: Datastore,
        content: Arc<dyn ContentStore>,
        service: Arc<PeerService>,
    ) -> Self {
        Self {
            account,
            datastore,
            content,
            service,
        }
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Register with `cafe` by answering its challenge with an account
    /// signature. `token` is the cafe's dev token, ignored by open cafes.
    pub async fn register(&self, cafe: &PeerId, token: &str) -> Result<CafeSession> {
        let address = self.account.address().to_string();

        let response = self
            .service
            .send_request(cafe, Payload::CafeChallenge(CafeChallenge { address: address.clone() }))
            .await?;
        let Payload::CafeNonce(nonce) = response.message.payload else {
            return Err(NodeError::UnexpectedPayload(response.payload().kind()));
        };

        let own_nonce = uuid::Uuid::new_v4().simple().to_string();
        let sig = self
            .account
            .sign(format!("{}{}", nonce.value, own_nonce).as_bytes());

        let registration = CafeRegistration {
            address,
            value: nonce.value,
            nonce: own_nonce,
            sig: sig.to_bytes().to_vec(),
            token: token.to_string(),
        };
        let response = self
            .service
            .send_request(cafe, Payload::CafeRegistration(registration))
            .await?;
        let session = expect_session(response)?;
        if session.id != *cafe {
            return Err(NodeError::BadRequest(format!(
                "session issued by {} instead of {}",
                session.id.short(),
                cafe.short()
            )));
        }

        self.datastore.with(|db| db.add_or_update_cafe_session(&session))?;
        self.service.learn_cafe(&session.cafe);
        info!(cafe = %cafe.short(), expires = %session.exp, "registered with cafe");
        Ok(session)
    }

    /// Forget the session and everything still queued for this cafe.
    pub fn deregister(&self, cafe: &PeerId) -> Result<()> {
        let (removed, dropped) = self.datastore.with(|db| {
            let removed = db.delete_cafe_session(cafe)?;
            let dropped = db.delete_cafe_requests_by_cafe(cafe)?;
            Ok((removed, dropped))
        })?;
        if !removed {
            return Err(NodeError::NoSession(cafe.short()));
        }
        info!(cafe = %cafe.short(), dropped, "deregistered from cafe");
        Ok(())
    }

    pub fn session(&self, cafe: &PeerId) -> Result<CafeSession> {
        self.datastore
            .with(|db| db.get_cafe_session(cafe))
            .map_err(|e| match e {
                StoreError::NotFound => NodeError::NoSession(cafe.short()),
                other => other.into(),
            })
    }

    /// Trade the session's refresh token for a new session.
    pub async fn refresh(&self, cafe: &PeerId) -> Result<CafeSession> {
        let session = self.session(cafe)?;
        let response = self
            .service
            .send_request(
                cafe,
                Payload::CafeRefreshSession(CafeRefreshSession {
                    access: session.access,
                    refresh: session.refresh,
                }),
            )
            .await?;
        let session = expect_session(response)?;

        self.datastore.with(|db| db.add_or_update_cafe_session(&session))?;
        debug!(cafe = %cafe.short(), expires = %session.exp, "refreshed cafe session");
        Ok(session)
    }

    /// Send an authenticated request built from the current session.
    ///
    /// An `Unauthorized` answer triggers one refresh and one retry; any
    /// second failure is returned as is.
    async fn send_cafe_request<F>(&self, cafe: &PeerId, build: F) -> Result<Envelope>
    where
        F: Fn(&CafeSession) -> Payload,
    {
        let session = self.session(cafe)?;
        match self.service.send_request(cafe, build(&session)).await {
            Err(NodeError::Unauthorized) => {
                debug!(cafe = %cafe.short(), "access token rejected, refreshing");
                let session = self.refresh(cafe).await?;
                self.service.send_request(cafe, build(&session)).await
            }
            other => other,
        }
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Pin `cids` on `cafe`, pushing whatever it does not hold yet.
    ///
    /// Objects missing locally are skipped: there is nothing to push and
    /// retrying would not change that.
    pub async fn store(&self, cafe: &PeerId, cids: &[ContentId]) -> Result<()> {
        if cids.is_empty() {
            return Ok(());
        }

        let response = self
            .send_cafe_request(cafe, |s| {
                Payload::CafeStore(CafeStore {
                    token: s.access.clone(),
                    cids: cids.to_vec(),
                })
            })
            .await?;
        let Payload::CafeObjectList(needed) = response.message.payload else {
            return Err(NodeError::UnexpectedPayload(response.payload().kind()));
        };

        for cid in &needed.cids {
            let data = match self.content.get(cid).await {
                Ok(data) => data,
                Err(ContentError::NotFound(_)) => {
                    warn!(cafe = %cafe.short(), object = %cid.short(), "object gone before upload");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            let response = self
                .send_cafe_request(cafe, |s| {
                    Payload::CafeObject(CafeObject {
                        token: s.access.clone(),
                        cid: cid.clone(),
                        data: data.clone(),
                    })
                })
                .await?;
            expect_stored(response)?;
        }

        debug!(cafe = %cafe.short(), requested = cids.len(), pushed = needed.cids.len(), "stored objects");
        Ok(())
    }

    pub async fn store_thread(&self, cafe: &PeerId, record: &ThreadRecord) -> Result<()> {
        let ciphertext = ThreadBackup::of(record).seal(&self.account)?;
        let response = self
            .send_cafe_request(cafe, |s| {
                Payload::CafeStoreThread(CafeStoreThread {
                    token: s.access.clone(),
                    id: record.id,
                    ciphertext: ciphertext.clone(),
                })
            })
            .await?;
        expect_stored(response)?;
        debug!(cafe = %cafe.short(), thread = %record.id.short(), "stored thread backup");
        Ok(())
    }

    pub async fn unstore_thread(&self, cafe: &PeerId, id: &ThreadId) -> Result<()> {
        let response = self
            .send_cafe_request(cafe, |s| {
                Payload::CafeUnstoreThread(CafeUnstoreThread {
                    token: s.access.clone(),
                    id: *id,
                })
            })
            .await?;
        expect_stored(response)?;
        debug!(cafe = %cafe.short(), thread = %id.short(), "removed thread backup");
        Ok(())
    }

    /// Drop a sealed envelope into `client`'s inbox on `cafe`. Needs no
    /// session: any peer may deliver to a registered client.
    pub async fn deliver_message(
        &self,
        cafe: &Cafe,
        id: &ContentId,
        client: &PeerId,
        env: Vec<u8>,
    ) -> Result<()> {
        self.service.learn_cafe(cafe);
        let envelope = self.service.new_envelope(Payload::CafeDeliverMessage(CafeDeliverMessage {
            id: id.clone(),
            client: *client,
            env,
        }))?;
        self.service.send_message(&cafe.peer, envelope).await?;
        debug!(cafe = %cafe.peer.short(), client = %client.short(), message = %id.short(), "delivered to inbox");
        Ok(())
    }

    /// The oldest page of messages waiting in our inbox on `cafe`.
    pub async fn check_messages(&self, cafe: &PeerId) -> Result<CafeMessages> {
        let response = self
            .send_cafe_request(cafe, |s| {
                Payload::CafeCheckMessages(CafeCheckMessages {
                    token: s.access.clone(),
                })
            })
            .await?;
        match response.message.payload {
            Payload::CafeMessages(page) => Ok(page),
            other => Err(NodeError::UnexpectedPayload(other.kind())),
        }
    }

    /// Drop the messages a check returned, up to its `cursor`. True when
    /// more remain.
    pub async fn delete_messages(&self, cafe: &PeerId, cursor: i64) -> Result<bool> {
        let response = self
            .send_cafe_request(cafe, |s| {
                Payload::CafeDeleteMessages(CafeDeleteMessages {
                    token: s.access.clone(),
                    cursor,
                })
            })
            .await?;
        match response.message.payload {
            Payload::CafeDeleteMessagesAck(ack) => Ok(ack.more),
            other => Err(NodeError::UnexpectedPayload(other.kind())),
        }
    }
}

fn expect_session(response: Envelope) -> Result<CafeSession> {
    match response.message.payload {
        Payload::CafeSession(session) => Ok(session),
        other => Err(NodeError::UnexpectedPayload(other.kind())),
    }
}

fn expect_stored(response: Envelope) -> Result<()> {
    match response.message.payload {
        Payload::CafeStored(_) => Ok(()),
        other => Err(NodeError::UnexpectedPayload(other.kind())),
    }
}
