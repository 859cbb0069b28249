//! Registry of loaded threads and pending invites.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tracing::{debug, info, warn};

use loom_shared::block::{BlockBody, BlockHeader, InvitePayload, ThreadBlock};
use loom_shared::crypto;
use loom_shared::protocol::ThreadEnvelope;
use loom_shared::types::{
    Address, BlockType, CafeRequestType, ContentId, PeerId, ThreadId, ThreadSharing, ThreadType,
};
use loom_shared::Identity;
use loom_store::{StoreError, ThreadInvite, ThreadPeer, ThreadRecord};

use crate::error::{NodeError, Result};
use crate::thread::{access, Thread, ThreadContext};

/// Parameters of a new thread.
#[derive(Debug, Clone)]
pub struct AddThreadConfig {
    /// Application key, unique per node
    pub key: String,
    pub name: String,
    pub schema: Option<ContentId>,
    pub thread_type: ThreadType,
    pub sharing: ThreadSharing,
    pub whitelist: Vec<Address>,
}

/// Thread id derived from the thread's secret key.
pub fn thread_id(secret: &[u8; 32]) -> ThreadId {
    ThreadId(Identity::from_secret_bytes(secret).peer_id().0)
}

pub struct Threads {
    ctx: Arc<ThreadContext>,
    loaded: RwLock<HashMap<ThreadId, Arc<Thread>>>,
}

impl Threads {
    /// Load every persisted thread.
    pub fn new(ctx: Arc<ThreadContext>) -> Result<Self> {
        let records = ctx.datastore.with(|db| db.list_threads())?;
        let loaded = records
            .iter()
            .map(|r| (r.id, Arc::new(Thread::new(r, ctx.clone()))))
            .collect::<HashMap<_, _>>();

        debug!(count = loaded.len(), "threads loaded");
        Ok(Self {
            ctx,
            loaded: RwLock::new(loaded),
        })
    }

    pub fn context(&self) -> &Arc<ThreadContext> {
        &self.ctx
    }

    pub fn get(&self, id: &ThreadId) -> Option<Arc<Thread>> {
        self.loaded.read().ok()?.get(id).cloned()
    }

    pub fn get_by_key(&self, key: &str) -> Result<Option<Arc<Thread>>> {
        match self.ctx.datastore.with(|db| db.get_thread_by_key(key)) {
            Ok(record) => Ok(self.get(&record.id)),
            Err(StoreError::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn list(&self) -> Vec<Arc<Thread>> {
        self.loaded
            .read()
            .map(|threads| threads.values().cloned().collect())
            .unwrap_or_default()
    }

    fn load(&self, record: &ThreadRecord) -> Result<Arc<Thread>> {
        self.ctx.datastore.with(|db| db.add_thread(record))?;
        let thread = Arc::new(Thread::new(record, self.ctx.clone()));
        if let Ok(mut loaded) = self.loaded.write() {
            loaded.insert(record.id, thread.clone());
        }
        Ok(thread)
    }

    /// Create a thread initiated by this account and join it.
    pub async fn add_thread(&self, config: AddThreadConfig) -> Result<Arc<Thread>> {
        if self.get_by_key(&config.key)?.is_some() {
            return Err(NodeError::ThreadExists);
        }

        let secret = crypto::generate_symmetric_key();
        let record = ThreadRecord {
            id: thread_id(&secret),
            key: config.key,
            secret,
            name: config.name,
            schema: config.schema,
            initiator: self.ctx.account.address(),
            thread_type: config.thread_type,
            sharing: config.sharing,
            whitelist: config.whitelist,
            head: Vec::new(),
            created_at: Utc::now(),
        };

        let thread = self.load(&record)?;
        thread.add_join(None).await?;

        info!(thread = %record.id.short(), key = %record.key, kind = %record.thread_type, "added thread");
        Ok(thread)
    }

    /// Leave a thread and forget it locally.
    pub async fn remove_thread(&self, id: &ThreadId) -> Result<ContentId> {
        let thread = self
            .get(id)
            .ok_or_else(|| NodeError::ThreadNotFound(id.to_hex()))?;

        let leave = thread.add_leave().await?;
        self.ctx
            .cafe_outbox
            .add(&id.to_hex(), CafeRequestType::UnstoreThread, None)?;
        self.ctx.datastore.with(|db| db.delete_thread(id))?;
        if let Ok(mut loaded) = self.loaded.write() {
            loaded.remove(id);
        }
        self.ctx.kick_flush();

        info!(thread = %id.short(), "removed thread");
        Ok(leave)
    }

    /// Re-publish this node's contact to every thread.
    pub async fn announce_all(&self) {
        for thread in self.list() {
            if let Err(e) = thread.add_announce(None).await {
                warn!(thread = %thread.id().short(), error = %e, "announce failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Route a thread envelope to its thread, or treat it as an invite
    /// when the thread is unknown.
    pub async fn handle_envelope(&self, from: &PeerId, env: &ThreadEnvelope) -> Result<ContentId> {
        self.ctx.service.verify_thread_envelope(env)?;

        if let Some(thread) = self.get(&env.thread) {
            if self.ctx.identity.open(&env.ciphertext).is_ok() {
                debug!(thread = %env.thread.short(), "invite for a thread we have");
                return Err(NodeError::ThreadExists);
            }
            return thread.handle_envelope(from, env).await;
        }

        self.handle_invite(from, env).await
    }

    async fn handle_invite(&self, from: &PeerId, env: &ThreadEnvelope) -> Result<ContentId> {
        let plaintext = self.ctx.identity.open(&env.ciphertext)?;
        let block = ThreadBlock::from_bytes(&plaintext)?;
        let BlockBody::Invite(payload) = &block.body else {
            return Err(NodeError::BlockWrongType {
                expected: BlockType::Invite,
                actual: block.block_type(),
            });
        };
        block.verify_signature()?;
        if thread_id(&payload.secret) != env.thread {
            return Err(NodeError::InvalidBlock("invite secret does not match thread".to_string()));
        }
        let inviter = block
            .header
            .author
            .ok_or_else(|| NodeError::InvalidBlock("invite without author".to_string()))?;

        // Invites from our own account (another of our peers) join directly
        let own_account = self.ctx.account.address();
        if env.account_sig.as_ref().map(|s| s.address) == Some(own_account) {
            info!(thread = %env.thread.short(), from = %from.short(), "accepting invite from own account");
            self.join(&block.header, payload, inviter).await?;
            return Ok(env.hash.clone());
        }

        let invite = ThreadInvite {
            id: env.hash.clone(),
            thread_id: env.thread,
            name: payload.name.clone(),
            inviter,
            block: plaintext,
            date: block.header.date,
        };
        if self.ctx.datastore.with(|db| db.add_thread_invite(&invite))? {
            info!(thread = %env.thread.short(), invite = %invite.id.short(), inviter = %inviter.short(), "received invite");
        }
        Ok(env.hash.clone())
    }

    pub fn invites(&self) -> Result<Vec<ThreadInvite>> {
        Ok(self.ctx.datastore.with(|db| db.list_thread_invites())?)
    }

    fn invite(&self, id: &ContentId) -> Result<ThreadInvite> {
        self.ctx
            .datastore
            .with(|db| db.get_thread_invite(id))
            .map_err(|e| match e {
                StoreError::NotFound => NodeError::InviteNotFound(id.short().to_string()),
                other => other.into(),
            })
    }

    /// Join the thread described by a pending invite.
    pub async fn accept_invite(&self, id: &ContentId) -> Result<Arc<Thread>> {
        let invite = self.invite(id)?;
        let block = ThreadBlock::from_bytes(&invite.block)?;
        let BlockBody::Invite(payload) = &block.body else {
            return Err(NodeError::BlockWrongType {
                expected: BlockType::Invite,
                actual: block.block_type(),
            });
        };

        let thread = self.join(&block.header, payload, invite.inviter).await?;
        self.ctx.datastore.with(|db| db.delete_thread_invite(id))?;
        Ok(thread)
    }

    pub fn ignore_invite(&self, id: &ContentId) -> Result<()> {
        self.invite(id)?;
        self.ctx.datastore.with(|db| db.delete_thread_invite(id))?;
        Ok(())
    }

    /// Create the invited thread, catch up from the inviter and post a JOIN.
    async fn join(
        &self,
        header: &BlockHeader,
        payload: &InvitePayload,
        inviter: PeerId,
    ) -> Result<Arc<Thread>> {
        let id = thread_id(&payload.secret);
        if self.get(&id).is_some() {
            return Err(NodeError::ThreadExists);
        }

        let record = ThreadRecord {
            id,
            key: payload.key.clone(),
            secret: payload.secret,
            name: payload.name.clone(),
            schema: payload.schema.clone(),
            initiator: payload.initiator,
            thread_type: payload.thread_type,
            sharing: payload.sharing,
            whitelist: payload.whitelist.clone(),
            head: Vec::new(),
            created_at: Utc::now(),
        };
        if !access::readable(&record, &self.ctx.account.address()) {
            return Err(NodeError::NotReadable);
        }

        let thread = self.load(&record)?;
        self.ctx.datastore.with(|db| {
            db.add_thread_peer(&ThreadPeer {
                id: inviter,
                thread_id: id,
                welcomed: false,
            })
        })?;

        let reached = thread.follow_parents(&header.parents, Some(&inviter)).await?;
        debug!(thread = %id.short(), reached = reached.len(), "caught up from inviter");
        if !header.parents.is_empty() {
            thread.update_head(header.parents.clone())?;
        }

        thread.add_join(Some(inviter)).await?;
        info!(thread = %id.short(), inviter = %inviter.short(), "joined thread");
        Ok(thread)
    }
}
