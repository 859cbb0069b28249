use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use loom_shared::constants::QUEUE_BATCH_SIZE;
use loom_shared::crypto;
use loom_shared::protocol::{Cafe, Envelope};
use loom_shared::types::{CafeRequestType, ContentId, PeerId, ThreadId};
use loom_store::{CafeRequest, Datastore, StoreError};

use crate::cafe::CafeClient;
use crate::content::ContentStore;
use crate::error::Result;

/// Requests to our cafes: pin content, back up threads, deliver messages
/// into other peers' inboxes.
pub struct CafeOutbox {
    local: PeerId,
    datastore: Datastore,
    content: Arc<dyn ContentStore>,
    client: Arc<CafeClient>,
    flushing: Mutex<()>,
}

impl CafeOutbox {
    pub fn new(
        local: PeerId,
        datastore: Datastore,
        content: Arc<dyn ContentStore>,
        client: Arc<CafeClient>,
    ) -> Self {
        Self {
            local,
            datastore,
            content,
            client,
            flushing: Mutex::new(()),
        }
    }

    /// Queue one request per active cafe session.
    pub fn add(&self, target: &str, request_type: CafeRequestType, sync_group: Option<&ContentId>) -> Result<()> {
        let sessions = self.datastore.with(|db| db.list_cafe_sessions())?;
        for session in sessions {
            self.insert(self.local, target, session.cafe, request_type, sync_group.cloned())?;
        }
        Ok(())
    }

    /// Park `envelope` in each of `peer`'s inbox cafes.
    ///
    /// The envelope is sealed to the recipient's peer key and stored
    /// locally; the DELIVER_MESSAGE requests carry its content id.
    pub async fn inbox_request(&self, peer: &PeerId, envelope: &Envelope, inboxes: &[Cafe]) -> Result<()> {
        let sealed = crypto::seal(&peer.0, &envelope.to_bytes()?)?;
        let id = self.content.add(&sealed).await?;

        for cafe in inboxes {
            self.insert(*peer, id.as_str(), cafe.clone(), CafeRequestType::Inbox, None)?;
        }
        debug!(peer = %peer.short(), message = %id.short(), inboxes = inboxes.len(), "queued inbox delivery");
        Ok(())
    }

    fn insert(
        &self,
        peer: PeerId,
        target: &str,
        cafe: Cafe,
        request_type: CafeRequestType,
        sync_group: Option<ContentId>,
    ) -> Result<()> {
        let req = CafeRequest {
            seq: 0,
            id: uuid::Uuid::new_v4().to_string(),
            peer,
            target: target.to_string(),
            cafe,
            request_type,
            sync_group,
            date: Utc::now(),
        };
        self.datastore.with(|db| db.add_cafe_request(&req))?;
        Ok(())
    }

    /// Drain the queue, batching requests by cafe and type.
    pub async fn flush(&self) -> Result<()> {
        let Ok(_guard) = self.flushing.try_lock() else {
            debug!("cafe outbox flush already running");
            return Ok(());
        };

        let mut offset = 0;
        let mut done = 0usize;
        loop {
            let page = self
                .datastore
                .with(|db| db.list_cafe_requests(offset, QUEUE_BATCH_SIZE))?;
            let Some(last) = page.last() else {
                break;
            };
            offset = last.seq;

            let mut groups: HashMap<(PeerId, CafeRequestType), Vec<CafeRequest>> = HashMap::new();
            for req in page {
                groups
                    .entry((req.cafe.peer, req.request_type))
                    .or_default()
                    .push(req);
            }

            let handled = join_all(
                groups
                    .into_iter()
                    .map(|((_, kind), reqs)| self.handle_group(kind, reqs)),
            )
            .await;
            for id in handled.into_iter().flatten() {
                self.datastore.with(|db| db.delete_cafe_request(&id))?;
                done += 1;
            }
        }

        if done > 0 {
            info!(count = done, "cafe outbox flushed");
        }
        Ok(())
    }

    async fn handle_group(&self, kind: CafeRequestType, reqs: Vec<CafeRequest>) -> Vec<String> {
        let Some(cafe) = reqs.first().map(|r| r.cafe.clone()) else {
            return Vec::new();
        };

        if kind == CafeRequestType::Store {
            return self.store_batch(&cafe, reqs).await;
        }

        let mut handled = Vec::with_capacity(reqs.len());
        for req in reqs {
            match self.handle(&req).await {
                Ok(()) => handled.push(req.id),
                Err(e) => {
                    warn!(cafe = %cafe.peer.short(), kind = %kind, target = %req.target, error = %e, "cafe request failed");
                    break;
                }
            }
        }
        handled
    }

    /// One STORE round for all content ids queued for `cafe`.
    async fn store_batch(&self, cafe: &Cafe, reqs: Vec<CafeRequest>) -> Vec<String> {
        let mut handled = Vec::new();
        let mut cids = Vec::new();
        for req in &reqs {
            match ContentId::parse(&req.target) {
                Ok(cid) => cids.push(cid),
                Err(e) => {
                    warn!(target = %req.target, error = %e, "dropping malformed store request");
                    handled.push(req.id.clone());
                }
            }
        }

        match self.client.store(&cafe.peer, &cids).await {
            Ok(()) => {
                handled.extend(reqs.into_iter().map(|r| r.id));
                handled.sort();
                handled.dedup();
            }
            Err(e) => warn!(cafe = %cafe.peer.short(), count = cids.len(), error = %e, "store failed"),
        }
        handled
    }

    async fn handle(&self, req: &CafeRequest) -> Result<()> {
        match req.request_type {
            CafeRequestType::Store => {
                let cid = ContentId::parse(&req.target)?;
                self.client.store(&req.cafe.peer, &[cid]).await
            }
            CafeRequestType::StoreThread => {
                let id = ThreadId::from_hex(&req.target)?;
                match self.datastore.with(|db| db.get_thread(&id)) {
                    Ok(record) => self.client.store_thread(&req.cafe.peer, &record).await,
                    // removed since queued, an UNSTORE_THREAD follows
                    Err(StoreError::NotFound) => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            CafeRequestType::UnstoreThread => {
                let id = ThreadId::from_hex(&req.target)?;
                self.client.unstore_thread(&req.cafe.peer, &id).await
            }
            CafeRequestType::Inbox => {
                let cid = ContentId::parse(&req.target)?;
                let sealed = self.content.get(&cid).await?;
                self.client
                    .deliver_message(&req.cafe, &cid, &req.peer, sealed)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use loom_shared::types::{CafeRequestType, ThreadSharing, ThreadType};

    use crate::cafe::CafeHostConfig;
    use crate::testing::{wait_until, TestNet};

    #[tokio::test]
    async fn test_requests_fan_out_per_session() {
        let net = TestNet::new();
        let c1 = net.cafe("c1", CafeHostConfig::open_registration()).await;
        let c2 = net.cafe("c2", CafeHostConfig::open_registration()).await;
        let p = net.idle_node("p").await;

        p.node.register_cafe(&c1.peer_id(), "").await.unwrap();
        p.node.register_cafe(&c2.peer_id(), "").await.unwrap();
        p.node.flush().await;

        p.node
            .cafe_outbox()
            .add("0f", CafeRequestType::UnstoreThread, None)
            .unwrap();
        let queued = p.node.datastore().with(|db| db.list_cafe_requests(0, 10)).unwrap();
        let mut cafes: Vec<_> = queued.iter().map(|r| r.cafe.peer).collect();
        cafes.sort();
        let mut expected = vec![c1.peer_id(), c2.peer_id()];
        expected.sort();
        assert_eq!(cafes, expected);
    }

    #[tokio::test]
    async fn test_blocks_and_thread_backup_reach_cafe() {
        let net = TestNet::new();
        let cafe = net.cafe("cafe", CafeHostConfig::open_registration()).await;
        let p = net.idle_node("p").await;
        p.node.register_cafe(&cafe.peer_id(), "").await.unwrap();

        let thread = p.create_thread("k1", ThreadType::Open, ThreadSharing::Shared).await;
        let id = thread.add_message("pinned remotely").await.unwrap();
        p.node.flush().await;

        assert!(wait_until(|| p.node.datastore().with(|db| db.count_cafe_requests()).unwrap() == 0).await);
        assert!(cafe.node.content().is_pinned(&id).await.unwrap());

        let client = p.peer_id();
        let backups = cafe
            .node
            .datastore()
            .with(|db| db.list_cafe_client_threads(&client))
            .unwrap();
        assert_eq!(backups.len(), 1);
        assert_eq!(backups[0].id, thread.id());

        let backup = crate::cafe::ThreadBackup::open(p.node.account(), &backups[0].ciphertext).unwrap();
        assert_eq!(backup.head, thread.head().unwrap());
    }
}
