//! Head resolution, back-propagation and welcomes.

use std::collections::HashSet;

use chrono::Duration;
use tracing::{debug, info, warn};

use loom_shared::block::{self, BlockBody, BlockHeader, ThreadBlock};
use loom_shared::crypto;
use loom_shared::types::{ContentId, PeerId};

use super::Thread;
use crate::content::ContentError;
use crate::error::{NodeError, Result};

impl Thread {
    /// Walk the ancestors of a block that are not indexed yet, fetching
    /// them locally or from `from`.
    ///
    /// Returns the ids reached: already-known ancestors where the walk
    /// stopped plus every block indexed on the way. A parent that cannot be
    /// fetched or decoded is logged and skipped.
    pub(crate) async fn follow_parents(
        &self,
        parents: &[ContentId],
        from: Option<&PeerId>,
    ) -> Result<HashSet<ContentId>> {
        let mut pending: Vec<ContentId> = parents.to_vec();
        let mut seen = HashSet::new();
        let mut reached = HashSet::new();

        while let Some(id) = pending.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            if self.ctx.datastore.with(|db| db.has_block(&id))? {
                reached.insert(id);
                continue;
            }

            let ciphertext = match self.fetch_ciphertext(&id, from).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(thread = %self.id.short(), block = %id.short(), error = %e, "parent unavailable");
                    continue;
                }
            };

            match self.handle_block(&id, &ciphertext).await {
                Ok(block) => {
                    debug!(thread = %self.id.short(), block = %id.short(), kind = %block.block_type(), "back-propagated");
                    pending.extend(block.header.parents.iter().cloned());
                    reached.insert(id);
                }
                Err(NodeError::BlockExists) => {
                    reached.insert(id);
                }
                Err(e) => {
                    warn!(thread = %self.id.short(), block = %id.short(), error = %e, "parent rejected");
                }
            }
        }

        Ok(reached)
    }

    async fn fetch_ciphertext(&self, id: &ContentId, from: Option<&PeerId>) -> Result<Vec<u8>> {
        match self.ctx.content.get(id).await {
            Ok(bytes) => Ok(bytes),
            Err(ContentError::NotFound(_)) => match from {
                Some(peer) => self.ctx.service.fetch_content(peer, id).await,
                None => Err(ContentError::NotFound(id.clone()).into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Decode a locally stored block.
    async fn load_block(&self, id: &ContentId) -> Result<ThreadBlock> {
        let ciphertext = self.ctx.content.get(id).await?;
        Ok(block::decode(&ciphertext, |c| crypto::decrypt(&self.key, c))?)
    }

    /// Fast-forward onto `inbound` when it descends from the current head,
    /// merge otherwise.
    pub(crate) async fn handle_head(&self, inbound: &ContentId, parents: &[ContentId]) -> Result<()> {
        let _guard = self.commit_lock.lock().await;

        let head = self.head()?;
        if head.contains(inbound) {
            return Ok(());
        }
        if head.is_empty() || head.iter().any(|h| parents.contains(h)) {
            debug!(thread = %self.id.short(), head = %inbound.short(), "fast-forward");
            return self.update_head(vec![inbound.clone()]);
        }

        let mut merged = head;
        merged.push(inbound.clone());
        let merge = self.merge(merged).await?;
        self.update_head(vec![merge])
    }

    /// Commit a MERGE of `parents`.
    ///
    /// Merges are plaintext, authorless and dated one millisecond after
    /// their newest parent, so any two peers merging the same heads write
    /// the same bytes. They are indexed but never posted.
    async fn merge(&self, mut parents: Vec<ContentId>) -> Result<ContentId> {
        parents.sort();
        parents.dedup();

        let mut newest = None;
        for parent in &parents {
            let date = self.load_block(parent).await?.header.date;
            newest = newest.max(Some(date));
        }
        let date = newest.ok_or_else(|| NodeError::InvalidBlock("merge without parents".to_string()))?
            + Duration::milliseconds(1);

        let merge = ThreadBlock::new(
            BlockHeader {
                date,
                parents,
                author: None,
                address: None,
            },
            BlockBody::Merge,
        );
        let ciphertext = block::encode(&merge, |p| crypto::encrypt(&self.key, p))?;
        let id = self.store_ciphertext(&ciphertext).await?;

        match self.index(&id, &merge) {
            Ok(()) | Err(NodeError::BlockExists) => {}
            Err(e) => return Err(e),
        }

        info!(thread = %self.id.short(), block = %id.short(), "merged heads");
        Ok(id)
    }

    /// Send the head to thread peers that have not been sent a block yet.
    pub(crate) async fn send_welcome(&self) -> Result<()> {
        let self_id = self.ctx.identity.peer_id();
        let unwelcomed = self
            .ctx
            .datastore
            .with(|db| db.list_unwelcomed_thread_peers(&self.id))?;
        if unwelcomed.is_empty() {
            return Ok(());
        }

        let Some(head) = self.head()?.into_iter().next() else {
            return Ok(());
        };
        let ciphertext = self.ctx.content.get(&head).await?;
        let envelope = self.ctx.service.new_thread_envelope(self.id, ciphertext, true)?;

        for peer in unwelcomed.iter().filter(|p| p.id != self_id) {
            self.ctx.block_outbox.add(&peer.id, &envelope, None)?;
            debug!(thread = %self.id.short(), peer = %peer.id.short(), "welcoming peer");
        }
        self.ctx
            .datastore
            .with(|db| db.welcome_thread_peers(&self.id))?;

        self.ctx.kick_flush();
        Ok(())
    }
}
