//! COMMENT, LIKE, FLAG and IGNORE blocks, which point at another block.

use tracing::debug;

use loom_shared::block::{BlockBody, CommentPayload, TargetPayload};
use loom_shared::types::{BlockType, ContentId};
use loom_store::StoreError;

use super::{access, Thread};
use crate::error::{NodeError, Result};

impl Thread {
    fn check_annotatable(&self) -> Result<()> {
        let record = self.record()?;
        if !access::annotatable(&record, &self.ctx.account.address()) {
            return Err(NodeError::NotAnnotatable);
        }
        Ok(())
    }

    pub async fn add_comment(&self, target: &ContentId, body: &str) -> Result<ContentId> {
        self.check_annotatable()?;
        self.commit_and_post(BlockBody::Comment(CommentPayload {
            target: target.clone(),
            body: body.to_string(),
        }))
        .await
    }

    pub async fn add_like(&self, target: &ContentId) -> Result<ContentId> {
        self.check_annotatable()?;
        self.commit_and_post(BlockBody::Like(TargetPayload {
            target: target.clone(),
        }))
        .await
    }

    pub async fn add_flag(&self, target: &ContentId) -> Result<ContentId> {
        self.check_annotatable()?;
        self.commit_and_post(BlockBody::Flag(TargetPayload {
            target: target.clone(),
        }))
        .await
    }

    /// Hide a block of this thread from listings and drop its file data.
    pub async fn add_ignore(&self, target: &ContentId) -> Result<ContentId> {
        self.check_annotatable()?;

        let block = self
            .ctx
            .datastore
            .with(|db| db.get_block(target))
            .map_err(|e| match e {
                StoreError::NotFound => NodeError::BlockNotFound(target.short().to_string()),
                other => other.into(),
            })?;
        if block.thread_id != self.id {
            return Err(NodeError::BlockNotFound(target.short().to_string()));
        }

        let id = self
            .commit_and_post(BlockBody::Ignore(TargetPayload {
                target: target.clone(),
            }))
            .await?;
        self.on_ignore(target).await?;
        Ok(id)
    }

    /// Unpin the file data of an ignored FILES block of this thread.
    pub(super) async fn on_ignore(&self, target: &ContentId) -> Result<()> {
        let block = match self.ctx.datastore.with(|db| db.get_block(target)) {
            Ok(block) => block,
            Err(StoreError::NotFound) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if block.thread_id != self.id {
            debug!(thread = %self.id.short(), target = %target.short(), "ignore targets another thread");
            return Ok(());
        }
        if block.block_type != BlockType::Files {
            return Ok(());
        }
        if let Some(data) = &block.target {
            self.ctx.content.unpin(data).await?;
            debug!(thread = %self.id.short(), data = %data.short(), "unpinned ignored files");
        }
        Ok(())
    }
}
