use thiserror::Error;

use loom_net::NetError;
use loom_shared::types::BlockType;
use loom_shared::{CodecError, CryptoError, IdentityError, ProtocolError, TokenError};
use loom_store::StoreError;

use crate::content::ContentError;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Content error: {0}")]
    Content(#[from] ContentError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Network error: {0}")]
    Net(NetError),

    // -- Permissions --
    #[error("Thread is not readable by this account")]
    NotReadable,

    #[error("Thread is not annotatable by this account")]
    NotAnnotatable,

    #[error("Thread is not writable by this account")]
    NotWritable,

    #[error("Thread is not shareable with this account")]
    NotShareable,

    // -- Idempotency --
    #[error("Block exists")]
    BlockExists,

    #[error("Thread exists")]
    ThreadExists,

    // -- Validation --
    #[error("Thread not found: {0}")]
    ThreadNotFound(String),

    #[error("Invite not found: {0}")]
    InviteNotFound(String),

    #[error("Contact not found: {0}")]
    ContactNotFound(String),

    #[error("Block not found in thread: {0}")]
    BlockNotFound(String),

    #[error("Expected a {expected} block, got {actual}")]
    BlockWrongType { expected: BlockType, actual: BlockType },

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Thread has no schema")]
    SchemaRequired,

    #[error("Unexpected {0} payload")]
    UnexpectedPayload(&'static str),

    #[error("Bad request: {0}")]
    BadRequest(String),

    // -- Transient --
    #[error("Peer {0} is unreachable")]
    Unreachable(String),

    #[error("Request timed out")]
    Timeout,

    // -- Cafes --
    #[error("No session with cafe {0}")]
    NoSession(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("Cafe answered {code}: {message}")]
    Cafe { code: u16, message: String },
}

impl NodeError {
    /// Idempotency signals callers treat as a successful no-op.
    pub fn is_benign(&self) -> bool {
        matches!(self, NodeError::BlockExists | NodeError::ThreadExists)
    }

    /// Status code carried in protocol error envelopes.
    pub fn status_code(&self) -> u16 {
        match self {
            NodeError::Unauthorized => 401,
            NodeError::Forbidden => 403,
            NodeError::ThreadNotFound(_)
            | NodeError::InviteNotFound(_)
            | NodeError::ContactNotFound(_)
            | NodeError::BlockNotFound(_)
            | NodeError::Content(ContentError::NotFound(_))
            | NodeError::Store(StoreError::NotFound) => 404,
            NodeError::BadRequest(_)
            | NodeError::Protocol(_)
            | NodeError::Identity(_)
            | NodeError::InvalidBlock(_)
            | NodeError::UnexpectedPayload(_) => 400,
            NodeError::Cafe { code, .. } => *code,
            _ => 500,
        }
    }
}

impl From<NetError> for NodeError {
    fn from(e: NetError) -> Self {
        match e {
            NetError::Unreachable(peer) => NodeError::Unreachable(peer),
            NetError::Offline => NodeError::Unreachable("local node offline".to_string()),
            NetError::Timeout => NodeError::Timeout,
            other => NodeError::Net(other),
        }
    }
}

impl From<TokenError> for NodeError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::NoToken | TokenError::Expired => NodeError::Unauthorized,
            TokenError::Invalid => NodeError::Forbidden,
        }
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;
