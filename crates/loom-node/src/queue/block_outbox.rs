use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use loom_shared::constants::QUEUE_BATCH_SIZE;
use loom_shared::protocol::Envelope;
use loom_shared::types::{ContentId, PeerId};
use loom_store::{BlockMessage, Datastore, StoreError};

use super::CafeOutbox;
use crate::error::{NodeError, Result};
use crate::service::PeerService;

/// Outgoing thread envelopes, one row per recipient.
///
/// A message is tried directly first. When the recipient cannot be reached
/// it is handed to the cafe outbox as a DELIVER_MESSAGE for each of the
/// recipient's inbox cafes. A recipient with no inboxes keeps its messages
/// queued until the next flush.
pub struct BlockOutbox {
    datastore: Datastore,
    service: Arc<PeerService>,
    cafe_outbox: Arc<CafeOutbox>,
    flushing: Mutex<()>,
}

impl BlockOutbox {
    pub fn new(datastore: Datastore, service: Arc<PeerService>, cafe_outbox: Arc<CafeOutbox>) -> Self {
        Self {
            datastore,
            service,
            cafe_outbox,
            flushing: Mutex::new(()),
        }
    }

    /// Queue `envelope` for `peer`.
    ///
    /// With a sync group, the message stays held while cafe requests of the
    /// same group are pending, so a block reaches the recipient only after
    /// its ciphertext is pinned on our cafes.
    pub fn add(&self, peer: &PeerId, envelope: &Envelope, sync_group: Option<ContentId>) -> Result<()> {
        let msg = BlockMessage {
            seq: 0,
            id: uuid::Uuid::new_v4().to_string(),
            peer: *peer,
            envelope: envelope.to_bytes()?,
            sync_group,
            date: Utc::now(),
        };
        self.datastore.with(|db| db.add_block_message(&msg))?;
        debug!(peer = %peer.short(), id = %msg.id, "queued block message");
        Ok(())
    }

    /// Drain the queue. A flush already in progress makes this a no-op.
    pub async fn flush(&self) -> Result<()> {
        let Ok(_guard) = self.flushing.try_lock() else {
            debug!("block outbox flush already running");
            return Ok(());
        };

        let mut offset = 0;
        let mut sent = 0usize;
        loop {
            let page = self
                .datastore
                .with(|db| db.list_block_messages(offset, QUEUE_BATCH_SIZE))?;
            let Some(last) = page.last() else {
                break;
            };
            offset = last.seq;

            let mut groups: BTreeMap<PeerId, Vec<BlockMessage>> = BTreeMap::new();
            for msg in page {
                groups.entry(msg.peer).or_default().push(msg);
            }

            let handled = join_all(groups.into_iter().map(|(peer, msgs)| self.send_group(peer, msgs))).await;
            for id in handled.into_iter().flatten() {
                self.datastore.with(|db| db.delete_block_message(&id))?;
                sent += 1;
            }
        }

        if sent > 0 {
            info!(count = sent, "block outbox flushed");
        }
        Ok(())
    }

    /// Handle one recipient's messages in order, stopping at the first
    /// failure. Returns the ids handled.
    async fn send_group(&self, peer: PeerId, msgs: Vec<BlockMessage>) -> Vec<String> {
        let mut handled = Vec::with_capacity(msgs.len());
        for msg in msgs {
            match self.handle(&msg).await {
                Ok(()) => handled.push(msg.id),
                Err(e) => {
                    debug!(peer = %peer.short(), error = %e, "block message kept for retry");
                    break;
                }
            }
        }
        handled
    }

    async fn handle(&self, msg: &BlockMessage) -> Result<()> {
        let envelope = Envelope::from_bytes(&msg.envelope)?;

        if self.service.is_online() {
            match self.service.send_message(&msg.peer, envelope.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => debug!(peer = %msg.peer.short(), error = %e, "direct send failed"),
            }
        }

        let contact = match self.datastore.with(|db| db.get_peer(&msg.peer)) {
            Ok(contact) => contact,
            Err(StoreError::NotFound) => return Err(NodeError::ContactNotFound(msg.peer.short())),
            Err(e) => return Err(e.into()),
        };
        if contact.inboxes.is_empty() {
            return Err(NodeError::Unreachable(msg.peer.short()));
        }

        self.cafe_outbox
            .inbox_request(&msg.peer, &envelope, &contact.inboxes)
            .await
            .inspect_err(|e| warn!(peer = %msg.peer.short(), error = %e, "inbox handoff failed"))
    }
}

#[cfg(test)]
mod tests {
    use loom_shared::protocol::{Cafe, Payload, Peer};
    use loom_shared::types::CafeRequestType;
    use loom_shared::Identity;

    use crate::testing::TestNet;

    /// Register a hub endpoint that accepts everything sent to it.
    fn sink(net: &TestNet) -> Identity {
        let identity = Identity::generate();
        let (_, mut rx) = net.hub().connect(identity.peer_id());
        tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                let _ = inbound.reply.send(None);
            }
        });
        identity
    }

    #[tokio::test]
    async fn test_flush_drains_more_than_one_batch() {
        let net = TestNet::new();
        let p = net.idle_node("p").await;
        let sinks: Vec<Identity> = (0..3).map(|_| sink(&net)).collect();

        let outbox = p.node.block_outbox();
        for i in 0..40 {
            let env = p.node.service().new_envelope(Payload::Ping).unwrap();
            outbox.add(&sinks[i % 3].peer_id(), &env, None).unwrap();
        }

        outbox.flush().await.unwrap();
        let left = p.node.datastore().with(|db| db.count_block_messages()).unwrap();
        assert_eq!(left, 0);
    }

    #[tokio::test]
    async fn test_unreachable_peer_without_inbox_is_kept() {
        let net = TestNet::new();
        let p = net.idle_node("p").await;
        let gone = Identity::generate().peer_id();

        let env = p.node.service().new_envelope(Payload::Ping).unwrap();
        p.node.block_outbox().add(&gone, &env, None).unwrap();
        p.node.block_outbox().flush().await.unwrap();

        let left = p.node.datastore().with(|db| db.count_block_messages()).unwrap();
        assert_eq!(left, 1);
    }

    #[tokio::test]
    async fn test_unreachable_peer_with_inbox_goes_to_cafe() {
        let net = TestNet::new();
        let p = net.idle_node("p").await;
        let gone = Identity::generate();
        let cafe = Identity::generate().peer_id();

        let contact = Peer {
            id: gone.peer_id(),
            address: loom_shared::Account::generate().address(),
            name: "gone".to_string(),
            avatar: None,
            inboxes: vec![Cafe {
                peer: cafe,
                address: loom_shared::Account::generate().address(),
                api: "v1".to_string(),
                protocol: "/loom/cafe/1.0.0".to_string(),
                node: "test".to_string(),
                url: String::new(),
            }],
            updated: chrono::Utc::now(),
        };
        p.node.add_contact(&contact).unwrap();

        let env = p.node.service().new_envelope(Payload::Ping).unwrap();
        p.node.block_outbox().add(&gone.peer_id(), &env, None).unwrap();
        p.node.block_outbox().flush().await.unwrap();

        let store = p.node.datastore();
        assert_eq!(store.with(|db| db.count_block_messages()).unwrap(), 0);
        let requests = store.with(|db| db.list_cafe_requests(0, 10)).unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].request_type, CafeRequestType::Inbox);
        assert_eq!(requests[0].peer, gone.peer_id());
        assert_eq!(requests[0].cafe.peer, cafe);

        // the sealed envelope opens with the recipient's key
        let cid = loom_shared::ContentId::parse(&requests[0].target).unwrap();
        let sealed = p.node.content().get(&cid).await.unwrap();
        let opened = gone.open(&sealed).unwrap();
        assert!(loom_shared::protocol::Envelope::from_bytes(&opened).is_ok());
    }
}
