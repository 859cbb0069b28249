use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use loom_shared::constants::{MAX_INBOX_ATTEMPTS, QUEUE_BATCH_SIZE};
use loom_shared::protocol::{Envelope, Payload};
use loom_shared::types::PeerId;
use loom_shared::Identity;
use loom_store::{CafeMessage, Datastore};

use crate::cafe::CafeClient;
use crate::content::ContentStore;
use crate::error::{NodeError, Result};
use crate::threads::Threads;

/// Messages other peers left in our cafe inboxes while we were away.
pub struct CafeInbox {
    identity: Identity,
    datastore: Datastore,
    content: Arc<dyn ContentStore>,
    client: Arc<CafeClient>,
    threads: Arc<Threads>,
    checking: AtomicBool,
    flushing: Mutex<()>,
}

impl CafeInbox {
    pub fn new(
        identity: Identity,
        datastore: Datastore,
        content: Arc<dyn ContentStore>,
        client: Arc<CafeClient>,
        threads: Arc<Threads>,
    ) -> Self {
        Self {
            identity,
            datastore,
            content,
            client,
            threads,
            checking: AtomicBool::new(false),
            flushing: Mutex::new(()),
        }
    }

    /// Download every cafe's waiting messages, then handle them.
    ///
    /// Only one check runs at a time; a concurrent call returns at once.
    pub async fn check_messages(&self) -> Result<()> {
        if self.checking.swap(true, Ordering::SeqCst) {
            debug!("inbox check already running");
            return Ok(());
        }
        let checked = self.download_all().await;
        self.checking.store(false, Ordering::SeqCst);
        checked?;

        self.flush().await
    }

    async fn download_all(&self) -> Result<()> {
        let sessions = self.datastore.with(|db| db.list_cafe_sessions())?;
        for session in sessions {
            if let Err(e) = self.download(&session.id).await {
                warn!(cafe = %session.id.short(), error = %e, "inbox check failed");
            }
        }
        Ok(())
    }

    async fn download(&self, cafe: &PeerId) -> Result<()> {
        let mut received = 0usize;
        loop {
            let page = self.client.check_messages(cafe).await?;
            for msg in &page.messages {
                if !msg.id.matches(&msg.env) {
                    warn!(cafe = %cafe.short(), message = %msg.id.short(), "inbox message does not match its id");
                    continue;
                }
                self.content.put(&msg.env).await?;
                self.datastore.with(|db| {
                    db.add_cafe_message(&CafeMessage {
                        seq: 0,
                        id: msg.id.clone(),
                        peer: msg.peer,
                        date: msg.date,
                        attempts: 0,
                    })
                })?;
                received += 1;
            }

            if !self.client.delete_messages(cafe, page.cursor).await? {
                break;
            }
        }

        if received > 0 {
            info!(cafe = %cafe.short(), count = received, "downloaded inbox messages");
        }
        Ok(())
    }

    /// Handle downloaded messages. A message failing
    /// [`MAX_INBOX_ATTEMPTS`] times is dropped.
    pub async fn flush(&self) -> Result<()> {
        let Ok(_guard) = self.flushing.try_lock() else {
            debug!("inbox flush already running");
            return Ok(());
        };

        let mut offset = 0;
        loop {
            let page = self
                .datastore
                .with(|db| db.list_cafe_messages(offset, QUEUE_BATCH_SIZE))?;
            let Some(last) = page.last() else {
                break;
            };
            offset = last.seq;

            let results = join_all(page.iter().map(|msg| self.handle(msg))).await;
            for (msg, result) in page.iter().zip(results) {
                match result {
                    Ok(()) => {
                        self.datastore.with(|db| db.delete_cafe_message(&msg.id))?;
                    }
                    Err(e) if msg.attempts + 1 >= MAX_INBOX_ATTEMPTS => {
                        warn!(message = %msg.id.short(), peer = %msg.peer.short(), error = %e, "dropping inbox message");
                        self.datastore.with(|db| db.delete_cafe_message(&msg.id))?;
                    }
                    Err(e) => {
                        debug!(message = %msg.id.short(), attempts = msg.attempts + 1, error = %e, "inbox message failed");
                        self.datastore.with(|db| db.add_cafe_message_attempt(&msg.id))?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle(&self, msg: &CafeMessage) -> Result<()> {
        let sealed = self.content.get(&msg.id).await?;
        let envelope = Envelope::from_bytes(&self.identity.open(&sealed)?)?;
        envelope.verify(&msg.peer)?;

        let Payload::ThreadEnvelope(env) = envelope.payload() else {
            return Err(NodeError::UnexpectedPayload(envelope.payload().kind()));
        };
        match self.threads.handle_envelope(&msg.peer, env).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_benign() => Ok(()),
            Err(e) => Err(e),
        }
    }
}
