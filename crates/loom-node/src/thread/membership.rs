//! JOIN, ANNOUNCE, LEAVE and direct invites.

use chrono::Utc;
use tracing::{debug, info};

use loom_shared::block::{
    self, AnnouncePayload, BlockBody, BlockHeader, InvitePayload, JoinPayload, ThreadBlock,
};
use loom_shared::crypto;
use loom_shared::types::{ContentId, PeerId};
use loom_store::{StoreError, ThreadPeer, ThreadRecord};

use super::{access, Thread};
use crate::error::{NodeError, Result};

impl Thread {
    /// Announce this node joining, carrying its contact card.
    pub async fn add_join(&self, inviter: Option<PeerId>) -> Result<ContentId> {
        let payload = JoinPayload {
            inviter,
            peer: self.ctx.contact()?,
        };
        self.commit_and_post(BlockBody::Join(payload)).await
    }

    pub async fn add_leave(&self) -> Result<ContentId> {
        self.commit_and_post(BlockBody::Leave).await
    }

    /// Publish the current contact card, optionally renaming the thread.
    /// Only the initiator may rename.
    pub async fn add_announce(&self, name: Option<String>) -> Result<ContentId> {
        let record = self.record()?;
        if let Some(name) = &name {
            if record.initiator != self.ctx.account.address() {
                return Err(NodeError::NotWritable);
            }
            self.ctx
                .datastore
                .with(|db| db.update_thread_name(&self.id, name))?;
        }

        let payload = AnnouncePayload {
            peer: Some(self.ctx.contact()?),
            name,
        };
        self.commit_and_post(BlockBody::Announce(payload)).await
    }

    /// Send `peer` everything needed to join this thread.
    ///
    /// The invite is sealed to the invitee's peer key and delivered
    /// directly; it is not part of the thread's graph.
    pub async fn add_invite(&self, peer: &PeerId) -> Result<ContentId> {
        let record = self.record()?;
        let contact = self
            .ctx
            .datastore
            .with(|db| db.get_peer(peer))
            .map_err(|e| match e {
                StoreError::NotFound => NodeError::ContactNotFound(peer.short()),
                other => other.into(),
            })?;

        if !access::shareable(&record, &self.ctx.account.address(), &contact.address) {
            return Err(NodeError::NotShareable);
        }

        let invite = ThreadBlock::new(
            BlockHeader {
                date: Utc::now(),
                parents: record.head.clone(),
                author: Some(self.ctx.identity.peer_id()),
                address: Some(self.ctx.account.address()),
            },
            BlockBody::Invite(invite_payload(&record)),
        )
        .sign(&self.ctx.account)?;
        let ciphertext = block::encode(&invite, |p| crypto::seal(&peer.0, p))?;
        let id = self.ctx.content.add(&ciphertext).await?;

        let envelope = self.ctx.service.new_thread_envelope(self.id, ciphertext, true)?;
        self.ctx.block_outbox.add(peer, &envelope, None)?;
        self.ctx.kick_flush();

        info!(thread = %self.id.short(), invite = %id.short(), peer = %peer.short(), "sent invite");
        Ok(id)
    }

    // ------------------------------------------------------------------
    // Inbound side effects
    // ------------------------------------------------------------------

    pub(super) fn on_join(&self, author: Option<PeerId>, payload: &JoinPayload) -> Result<()> {
        let Some(author) = author else {
            return Ok(());
        };
        if payload.peer.id == author {
            self.ctx
                .datastore
                .with(|db| db.add_or_update_peer(&payload.peer))?;
        }
        self.add_peer(author)
    }

    pub(super) fn on_announce(
        &self,
        record: &ThreadRecord,
        block: &ThreadBlock,
        payload: &AnnouncePayload,
    ) -> Result<()> {
        let Some(author) = block.header.author else {
            return Ok(());
        };

        if let Some(peer) = payload.peer.as_ref().filter(|p| p.id == author) {
            self.ctx.datastore.with(|db| db.add_or_update_peer(peer))?;
            self.add_peer(author)?;
        }

        if let Some(name) = &payload.name {
            if block.header.address == Some(record.initiator) {
                self.ctx
                    .datastore
                    .with(|db| db.update_thread_name(&self.id, name))?;
                debug!(thread = %self.id.short(), name = %name, "renamed by initiator");
            }
        }
        Ok(())
    }

    pub(super) fn on_leave(&self, author: Option<PeerId>) -> Result<()> {
        if let Some(author) = author {
            self.ctx
                .datastore
                .with(|db| db.delete_thread_peer(&author, &self.id))?;
        }
        Ok(())
    }

    /// Track `peer` as a thread peer still owed a welcome.
    fn add_peer(&self, peer: PeerId) -> Result<()> {
        if peer == self.ctx.identity.peer_id() {
            return Ok(());
        }
        let added = self.ctx.datastore.with(|db| {
            db.add_thread_peer(&ThreadPeer {
                id: peer,
                thread_id: self.id,
                welcomed: false,
            })
        })?;
        if added {
            debug!(thread = %self.id.short(), peer = %peer.short(), "new thread peer");
        }
        Ok(())
    }
}

fn invite_payload(record: &ThreadRecord) -> InvitePayload {
    InvitePayload {
        secret: record.secret,
        key: record.key.clone(),
        name: record.name.clone(),
        schema: record.schema.clone(),
        initiator: record.initiator,
        thread_type: record.thread_type,
        sharing: record.sharing,
        whitelist: record.whitelist.clone(),
    }
}
