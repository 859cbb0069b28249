//! MESSAGE and FILES blocks.

use std::collections::BTreeMap;

use loom_shared::block::{BlockBody, FilesPayload, MessagePayload};
use loom_shared::types::ContentId;

use super::{access, Thread};
use crate::error::{NodeError, Result};

impl Thread {
    fn check_writable(&self) -> Result<loom_store::ThreadRecord> {
        let record = self.record()?;
        if !access::writable(&record, &self.ctx.account.address()) {
            return Err(NodeError::NotWritable);
        }
        Ok(record)
    }

    pub async fn add_message(&self, body: &str) -> Result<ContentId> {
        self.check_writable()?;
        self.commit_and_post(BlockBody::Message(MessagePayload {
            body: body.to_string(),
        }))
        .await
    }

    /// Add a file set rooted at `target`. The thread must carry a schema.
    pub async fn add_files(
        &self,
        target: &ContentId,
        caption: &str,
        keys: BTreeMap<String, String>,
    ) -> Result<ContentId> {
        let record = self.check_writable()?;
        if record.schema.is_none() {
            return Err(NodeError::SchemaRequired);
        }

        self.on_files(target).await?;
        self.commit_and_post(BlockBody::Files(FilesPayload {
            target: target.clone(),
            caption: caption.to_string(),
            keys,
        }))
        .await
    }

    /// Keep file data we hold for a FILES block.
    pub(super) async fn on_files(&self, target: &ContentId) -> Result<()> {
        if self.ctx.content.has(target).await? {
            self.ctx.content.pin(target).await?;
        }
        Ok(())
    }
}
