//! A thread's encrypted block graph.
//!
//! Local writes go through [`Thread::commit`], which holds the thread's
//! commit lock from header construction until the head moves. Remote
//! blocks enter through [`Thread::handle_envelope`]: decrypt, check access,
//! index, apply the type's side effect, walk missing ancestors, then
//! resolve the head.

pub mod access;

mod annotations;
mod membership;
mod merge;
mod messages;

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use loom_shared::block::{self, BlockBody, BlockHeader, ThreadBlock};
use loom_shared::crypto::{self, SymmetricKey};
use loom_shared::protocol::{Peer, ThreadEnvelope};
use loom_shared::types::{BlockType, CafeRequestType, ContentId, PeerId, ThreadId};
use loom_shared::{Account, Identity};
use loom_store::{BlockRecord, Datastore, ThreadPeer, ThreadRecord};

use crate::content::ContentStore;
use crate::error::{NodeError, Result};
use crate::queue::{BlockOutbox, CafeOutbox};
use crate::service::PeerService;

/// Everything a thread needs from the node.
pub struct ThreadContext {
    pub identity: Identity,
    pub account: Account,
    pub name: String,
    pub datastore: Datastore,
    pub content: Arc<dyn ContentStore>,
    pub service: Arc<PeerService>,
    pub block_outbox: Arc<BlockOutbox>,
    pub cafe_outbox: Arc<CafeOutbox>,
}

impl ThreadContext {
    /// This node's contact card, listing the cafes holding its inbox.
    pub fn contact(&self) -> Result<Peer> {
        let inboxes = self
            .datastore
            .with(|db| db.list_cafe_sessions())?
            .into_iter()
            .map(|s| s.cafe)
            .collect();

        Ok(Peer {
            id: self.identity.peer_id(),
            address: self.account.address(),
            name: self.name.clone(),
            avatar: None,
            inboxes,
            updated: Utc::now(),
        })
    }

    /// Flush both outboxes in the background, cafe requests first so held
    /// block messages can follow.
    pub fn kick_flush(&self) {
        let cafe_outbox = self.cafe_outbox.clone();
        let block_outbox = self.block_outbox.clone();
        tokio::spawn(async move {
            if let Err(e) = cafe_outbox.flush().await {
                warn!(error = %e, "cafe outbox flush failed");
            }
            if let Err(e) = block_outbox.flush().await {
                warn!(error = %e, "block outbox flush failed");
            }
        });
    }
}

/// A block committed locally.
#[derive(Debug, Clone)]
pub struct Commit {
    pub id: ContentId,
    pub ciphertext: Vec<u8>,
    pub block: ThreadBlock,
}

pub struct Thread {
    id: ThreadId,
    key: SymmetricKey,
    ctx: Arc<ThreadContext>,
    commit_lock: Mutex<()>,
}

impl Thread {
    pub fn new(record: &ThreadRecord, ctx: Arc<ThreadContext>) -> Self {
        Self {
            id: record.id,
            key: crypto::derive_thread_key(&record.secret),
            ctx,
            commit_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn record(&self) -> Result<ThreadRecord> {
        self.ctx
            .datastore
            .with(|db| db.get_thread(&self.id))
            .map_err(|e| match e {
                loom_store::StoreError::NotFound => NodeError::ThreadNotFound(self.id.to_hex()),
                other => other.into(),
            })
    }

    pub fn head(&self) -> Result<Vec<ContentId>> {
        Ok(self.record()?.head)
    }

    pub fn peers(&self) -> Result<Vec<ThreadPeer>> {
        Ok(self.ctx.datastore.with(|db| db.list_thread_peers(&self.id))?)
    }

    /// Visible blocks, newest first.
    pub fn blocks(&self, offset: Option<&ContentId>, limit: usize) -> Result<Vec<BlockRecord>> {
        Ok(self
            .ctx
            .datastore
            .with(|db| db.list_blocks(&self.id, offset, limit))?)
    }

    fn self_address_check(&self, record: &ThreadRecord) -> Result<()> {
        if !access::readable(record, &self.ctx.account.address()) {
            return Err(NodeError::NotReadable);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Local writes
    // ------------------------------------------------------------------

    /// Encrypt and index a new block on top of the current head.
    pub(crate) async fn commit(&self, body: BlockBody) -> Result<Commit> {
        let _guard = self.commit_lock.lock().await;

        let record = self.record()?;
        let header = BlockHeader {
            date: Utc::now(),
            parents: record.head.clone(),
            author: Some(self.ctx.identity.peer_id()),
            address: Some(self.ctx.account.address()),
        };
        let block = ThreadBlock::new(header, body).sign(&self.ctx.account)?;
        let ciphertext = block::encode(&block, |p| crypto::encrypt(&self.key, p))?;

        let id = self.store_ciphertext(&ciphertext).await?;
        self.index(&id, &block)?;
        self.update_head(vec![id.clone()])?;

        debug!(thread = %self.id.short(), block = %id.short(), kind = %block.block_type(), "committed block");

        Ok(Commit {
            id,
            ciphertext,
            block,
        })
    }

    /// Queue a committed block for every other thread peer.
    pub(crate) fn post(&self, commit: &Commit) -> Result<()> {
        let self_id = self.ctx.identity.peer_id();
        let peers = self.peers()?;

        let envelope = self
            .ctx
            .service
            .new_thread_envelope(self.id, commit.ciphertext.clone(), true)?;

        for peer in peers.iter().filter(|p| p.id != self_id) {
            self.ctx
                .block_outbox
                .add(&peer.id, &envelope, Some(commit.id.clone()))?;
        }
        self.ctx.datastore.with(|db| db.welcome_thread_peers(&self.id))?;

        self.ctx.kick_flush();
        Ok(())
    }

    pub(crate) async fn commit_and_post(&self, body: BlockBody) -> Result<ContentId> {
        let commit = self.commit(body).await?;
        self.post(&commit)?;
        info!(
            thread = %self.id.short(),
            block = %commit.id.short(),
            "added {}",
            commit.block.block_type()
        );
        Ok(commit.id)
    }

    /// Pin a block's ciphertext and queue it for cafe backup.
    async fn store_ciphertext(&self, ciphertext: &[u8]) -> Result<ContentId> {
        let id = self.ctx.content.add(ciphertext).await?;
        self.ctx
            .cafe_outbox
            .add(id.as_str(), CafeRequestType::Store, Some(&id))?;
        Ok(id)
    }

    pub(crate) fn index(&self, id: &ContentId, block: &ThreadBlock) -> Result<()> {
        let record = BlockRecord {
            id: id.clone(),
            thread_id: self.id,
            author: block.header.author,
            address: block.header.address,
            block_type: block.block_type(),
            date: block.header.date,
            target: block.body.target().cloned(),
            body: block.body.text().map(str::to_string),
            parents: block.header.parents.clone(),
        };
        if !self.ctx.datastore.with(|db| db.add_block(&record))? {
            return Err(NodeError::BlockExists);
        }
        Ok(())
    }

    /// Move the head and queue a thread backup.
    pub(crate) fn update_head(&self, head: Vec<ContentId>) -> Result<()> {
        self.ctx
            .datastore
            .with(|db| db.update_thread_head(&self.id, &head))?;
        self.ctx
            .cafe_outbox
            .add(&self.id.to_hex(), CafeRequestType::StoreThread, None)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Remote blocks
    // ------------------------------------------------------------------

    /// Ingest a block delivered by `from` and resolve the head.
    pub async fn handle_envelope(&self, from: &PeerId, env: &ThreadEnvelope) -> Result<ContentId> {
        let block = self.handle_block(&env.hash, &env.ciphertext).await?;
        info!(
            thread = %self.id.short(),
            block = %env.hash.short(),
            from = %from.short(),
            "received {}",
            block.block_type()
        );

        let reached = self.follow_parents(&block.header.parents, Some(from)).await?;
        debug!(thread = %self.id.short(), reached = reached.len(), "ancestors resolved");

        self.handle_head(&env.hash, &block.header.parents).await?;
        self.send_welcome().await?;
        Ok(env.hash.clone())
    }

    /// Decrypt, validate and index one block.
    pub(crate) async fn handle_block(&self, id: &ContentId, ciphertext: &[u8]) -> Result<ThreadBlock> {
        if self.ctx.datastore.with(|db| db.has_block(id))? {
            return Err(NodeError::BlockExists);
        }
        if !id.matches(ciphertext) {
            return Err(NodeError::InvalidBlock(format!("{} does not match its bytes", id.short())));
        }

        let record = self.record()?;
        self.self_address_check(&record)?;

        let block = block::decode(ciphertext, |c| crypto::decrypt(&self.key, c))
            .map_err(|e| NodeError::InvalidBlock(e.to_string()))?;
        self.authorize(&record, &block)?;

        self.store_ciphertext(ciphertext).await?;
        self.index(id, &block)?;
        self.apply(&record, &block).await?;
        Ok(block)
    }

    /// Type-specific access check against the author's account. The
    /// header address only counts once the block signature proves it.
    fn authorize(&self, record: &ThreadRecord, block: &ThreadBlock) -> Result<()> {
        let kind = block.block_type();
        if kind == BlockType::Merge {
            return Ok(());
        }
        block
            .verify_signature()
            .map_err(|e| NodeError::InvalidBlock(e.to_string()))?;
        let address = block
            .header
            .address
            .ok_or_else(|| NodeError::InvalidBlock(format!("{kind} block without address")))?;

        match kind {
            BlockType::Join | BlockType::Announce | BlockType::Leave => {
                if !access::readable(record, &address) {
                    return Err(NodeError::NotReadable);
                }
            }
            BlockType::Message | BlockType::Files => {
                if !access::writable(record, &address) {
                    return Err(NodeError::NotWritable);
                }
            }
            BlockType::Comment | BlockType::Like | BlockType::Flag | BlockType::Ignore => {
                if !access::annotatable(record, &address) {
                    return Err(NodeError::NotAnnotatable);
                }
            }
            BlockType::Invite => {
                return Err(NodeError::InvalidBlock("invites are not thread blocks".to_string()))
            }
            BlockType::Merge => {}
        }
        Ok(())
    }

    /// Side effects of an indexed block.
    async fn apply(&self, record: &ThreadRecord, block: &ThreadBlock) -> Result<()> {
        let author = block.header.author;
        match &block.body {
            BlockBody::Join(payload) => self.on_join(author, payload),
            BlockBody::Announce(payload) => self.on_announce(record, block, payload),
            BlockBody::Leave => self.on_leave(author),
            BlockBody::Ignore(payload) => self.on_ignore(&payload.target).await,
            BlockBody::Files(payload) => self.on_files(&payload.target).await,
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::TestNet;
    use loom_shared::block::MessagePayload;
    use loom_shared::types::{ThreadSharing, ThreadType};

    use super::*;

    #[tokio::test]
    async fn test_commit_advances_head_and_indexes() {
        let net = TestNet::new();
        let p = net.idle_node("p").await;
        let thread = p.create_thread("k1", ThreadType::Open, ThreadSharing::Shared).await;

        let join = thread.head().unwrap();
        assert_eq!(join.len(), 1);

        let id = thread.add_message("hello").await.unwrap();
        assert_eq!(thread.head().unwrap(), vec![id.clone()]);

        let blocks = thread.blocks(None, 10).unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].id, id);
        assert_eq!(blocks[0].parents, join);
        assert_eq!(blocks[0].body.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_duplicate_envelope_is_benign_and_keeps_head() {
        let net = TestNet::new();
        let p = net.idle_node("p").await;
        let thread = p.create_thread("k1", ThreadType::Open, ThreadSharing::Shared).await;
        let id = thread.add_message("once").await.unwrap();

        let ciphertext = p.node.content().get(&id).await.unwrap();
        let env = ThreadEnvelope {
            thread: thread.id(),
            hash: id.clone(),
            ciphertext,
            account_sig: None,
        };

        let err = thread
            .handle_envelope(&PeerId([7u8; 32]), &env)
            .await
            .unwrap_err();
        assert!(err.is_benign());
        assert_eq!(thread.head().unwrap(), vec![id]);
        let count = p
            .node
            .datastore()
            .with(|db| db.count_blocks(&thread.id(), Some(BlockType::Message)))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_member_cannot_write_as_initiator() {
        let net = TestNet::new();
        let p = net.node("p").await;
        let q = net.node("q").await;
        let (pt, qt) = net.shared_thread(&p, &q, "k1", ThreadType::ReadOnly).await;

        let header = BlockHeader {
            date: Utc::now(),
            parents: qt.head().unwrap(),
            author: Some(q.peer_id()),
            address: Some(p.node.account().address()),
        };
        let body = BlockBody::Message(MessagePayload {
            body: "spoofed".to_string(),
        });
        let unsigned = ThreadBlock::new(header.clone(), body.clone());
        let mut countersigned = ThreadBlock::new(
            BlockHeader {
                address: Some(q.node.account().address()),
                ..header
            },
            body,
        )
        .sign(q.node.account())
        .unwrap();
        countersigned.header.address = Some(p.node.account().address());

        for forged in [unsigned, countersigned] {
            let ciphertext = block::encode(&forged, |b| crypto::encrypt(&qt.key, b)).unwrap();
            let env = ThreadEnvelope {
                thread: qt.id(),
                hash: ContentId::of(&ciphertext),
                ciphertext,
                account_sig: None,
            };

            let err = pt.handle_envelope(&q.peer_id(), &env).await.unwrap_err();
            assert!(matches!(err, NodeError::InvalidBlock(_)));
        }

        let messages = p
            .node
            .datastore()
            .with(|db| db.count_blocks(&pt.id(), Some(BlockType::Message)))
            .unwrap();
        assert_eq!(messages, 0);
    }
}
