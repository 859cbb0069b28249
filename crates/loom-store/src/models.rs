//! Domain model structs persisted in the node database.
//!
//! Contacts, cafes and cafe sessions are wire types from `loom-shared` and
//! are stored as-is; everything else is defined here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use loom_shared::types::{
    Address, BlockType, CafeRequestType, ContentId, PeerId, ThreadId, ThreadSharing, ThreadType,
};

pub use loom_shared::protocol::{Cafe, CafeSession, Peer};

// ---------------------------------------------------------------------------
// Thread
// ---------------------------------------------------------------------------

/// A thread's persisted configuration and head.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadRecord {
    pub id: ThreadId,
    /// Application key, unique per node.
    pub key: String,
    /// Secret half of the thread keypair.
    pub secret: [u8; 32],
    pub name: String,
    pub schema: Option<ContentId>,
    pub initiator: Address,
    pub thread_type: ThreadType,
    pub sharing: ThreadSharing,
    /// Accounts allowed in; empty means everyone.
    pub whitelist: Vec<Address>,
    /// Current tip; empty before the first join.
    pub head: Vec<ContentId>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

/// Denormalized index row for a thread block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockRecord {
    pub id: ContentId,
    pub thread_id: ThreadId,
    pub author: Option<PeerId>,
    pub address: Option<Address>,
    pub block_type: BlockType,
    pub date: DateTime<Utc>,
    pub target: Option<ContentId>,
    pub body: Option<String>,
    pub parents: Vec<ContentId>,
}

// ---------------------------------------------------------------------------
// Thread peer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadPeer {
    pub id: PeerId,
    pub thread_id: ThreadId,
    /// Whether this peer has been sent the thread head at least once.
    pub welcomed: bool,
}

// ---------------------------------------------------------------------------
// Invite
// ---------------------------------------------------------------------------

/// An invite received for a thread we do not have yet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ThreadInvite {
    pub id: ContentId,
    pub thread_id: ThreadId,
    pub name: String,
    pub inviter: PeerId,
    /// Opened (plaintext) invite block.
    pub block: Vec<u8>,
    pub date: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Queues
// ---------------------------------------------------------------------------

/// A signed envelope waiting to be delivered to a thread peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockMessage {
    /// Queue position, used as the pagination cursor.
    pub seq: i64,
    pub id: String,
    pub peer: PeerId,
    pub envelope: Vec<u8>,
    /// Held back while cafe requests of the same group are pending.
    pub sync_group: Option<ContentId>,
    pub date: DateTime<Utc>,
}

/// Durable work item for a cafe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CafeRequest {
    pub seq: i64,
    pub id: String,
    /// Owner of the data, or the recipient for inbox requests.
    pub peer: PeerId,
    /// Content id or thread id, depending on `request_type`.
    pub target: String,
    pub cafe: Cafe,
    pub request_type: CafeRequestType,
    pub sync_group: Option<ContentId>,
    pub date: DateTime<Utc>,
}

/// An inbox message fetched from a cafe, waiting to be handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CafeMessage {
    pub seq: i64,
    pub id: ContentId,
    /// Sender.
    pub peer: PeerId,
    pub date: DateTime<Utc>,
    pub attempts: i64,
}

// ---------------------------------------------------------------------------
// Cafe host
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CafeClient {
    pub id: PeerId,
    pub address: Address,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CafeClientNonce {
    pub value: String,
    pub address: Address,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CafeClientThread {
    pub id: ThreadId,
    pub client_id: PeerId,
    pub ciphertext: Vec<u8>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CafeClientMessage {
    /// Inbox position, assigned on insert.
    pub seq: i64,
    pub id: ContentId,
    /// Sender.
    pub peer: PeerId,
    pub client_id: PeerId,
    pub envelope: Vec<u8>,
    pub date: DateTime<Utc>,
}

/// A dev token accepted for registration, stored by hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CafeToken {
    pub id: String,
    pub token_hash: String,
    pub created_at: DateTime<Utc>,
}
