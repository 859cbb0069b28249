use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::identity::{verify_signature_bytes, Identity};
use crate::types::{Address, ContentId, PeerId, ThreadId};

// ---------------------------------------------------------------------------
// Contacts and cafes
// ---------------------------------------------------------------------------

/// A peer's contact card, merged last-writer-wins on `updated`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Peer {
    pub id: PeerId,
    pub address: Address,
    pub name: String,
    pub avatar: Option<String>,
    /// Cafes holding an inbox for this peer
    pub inboxes: Vec<Cafe>,
    pub updated: DateTime<Utc>,
}

/// Public description of a cafe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Cafe {
    pub peer: PeerId,
    pub address: Address,
    pub api: String,
    pub protocol: String,
    pub node: String,
    /// Base URL of the HTTP binding, empty when only reachable peer-to-peer
    pub url: String,
}

/// A registration with a cafe, as issued by the cafe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CafeSession {
    /// Cafe peer id
    pub id: PeerId,
    pub access: String,
    pub exp: DateTime<Utc>,
    pub refresh: String,
    pub rexp: DateTime<Utc>,
    pub subject: PeerId,
    pub token_type: String,
    pub cafe: Cafe,
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Every message exchanged between peers and cafes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Payload {
    Ping,
    Pong,

    /// Encrypted thread block addressed to a thread
    ThreadEnvelope(ThreadEnvelope),

    ContentRequest(ContentRequest),
    ContentResponse(ContentResponse),

    CafeChallenge(CafeChallenge),
    CafeNonce(CafeNonce),
    CafeRegistration(CafeRegistration),
    CafeSession(CafeSession),
    CafeRefreshSession(CafeRefreshSession),
    CafeStore(CafeStore),
    CafeObjectList(CafeObjectList),
    CafeObject(CafeObject),
    CafeStored(CafeStored),
    CafeStoreThread(CafeStoreThread),
    CafeUnstoreThread(CafeUnstoreThread),
    CafeDeliverMessage(CafeDeliverMessage),
    CafeCheckMessages(CafeCheckMessages),
    CafeMessages(CafeMessages),
    CafeDeleteMessages(CafeDeleteMessages),
    CafeDeleteMessagesAck(CafeDeleteMessagesAck),
    /// Cafe to client: inbox messages are waiting
    CafeYouHaveMail,

    Error(ErrorMessage),
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Ping => "PING",
            Payload::Pong => "PONG",
            Payload::ThreadEnvelope(_) => "THREAD_ENVELOPE",
            Payload::ContentRequest(_) => "CONTENT_REQUEST",
            Payload::ContentResponse(_) => "CONTENT_RESPONSE",
            Payload::CafeChallenge(_) => "CAFE_CHALLENGE",
            Payload::CafeNonce(_) => "CAFE_NONCE",
            Payload::CafeRegistration(_) => "CAFE_REGISTRATION",
            Payload::CafeSession(_) => "CAFE_SESSION",
            Payload::CafeRefreshSession(_) => "CAFE_REFRESH_SESSION",
            Payload::CafeStore(_) => "CAFE_STORE",
            Payload::CafeObjectList(_) => "CAFE_OBJECT_LIST",
            Payload::CafeObject(_) => "CAFE_OBJECT",
            Payload::CafeStored(_) => "CAFE_STORED",
            Payload::CafeStoreThread(_) => "CAFE_STORE_THREAD",
            Payload::CafeUnstoreThread(_) => "CAFE_UNSTORE_THREAD",
            Payload::CafeDeliverMessage(_) => "CAFE_DELIVER_MESSAGE",
            Payload::CafeCheckMessages(_) => "CAFE_CHECK_MESSAGES",
            Payload::CafeMessages(_) => "CAFE_MESSAGES",
            Payload::CafeDeleteMessages(_) => "CAFE_DELETE_MESSAGES",
            Payload::CafeDeleteMessagesAck(_) => "CAFE_DELETE_MESSAGES_ACK",
            Payload::CafeYouHaveMail => "CAFE_YOU_HAVE_MAIL",
            Payload::Error(_) => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadEnvelope {
    pub thread: ThreadId,
    /// Content id of `ciphertext`
    pub hash: ContentId,
    pub ciphertext: Vec<u8>,
    /// Optional account signature over `ciphertext`
    pub account_sig: Option<AccountSignature>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSignature {
    pub address: Address,
    pub sig: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentRequest {
    pub id: ContentId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentResponse {
    pub id: ContentId,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CafeChallenge {
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CafeNonce {
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CafeRegistration {
    pub address: String,
    /// Nonce issued by the cafe
    pub value: String,
    /// Nonce generated by the registering peer
    pub nonce: String,
    /// Account signature over `value` followed by `nonce`
    pub sig: Vec<u8>,
    /// Dev token gating registration
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CafeRefreshSession {
    pub access: String,
    pub refresh: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CafeStore {
    pub token: String,
    pub cids: Vec<ContentId>,
}

/// Content ids the cafe still needs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CafeObjectList {
    pub cids: Vec<ContentId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CafeObject {
    pub token: String,
    pub cid: ContentId,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CafeStored {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CafeStoreThread {
    pub token: String,
    pub id: ThreadId,
    /// Thread backup sealed to the account key
    pub ciphertext: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CafeUnstoreThread {
    pub token: String,
    pub id: ThreadId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CafeDeliverMessage {
    pub id: ContentId,
    pub client: PeerId,
    /// Envelope sealed to the client's peer key
    pub env: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CafeCheckMessages {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CafeMessages {
    pub messages: Vec<CafeInboxMessage>,
    /// Inbox position of the last message in the page, echoed back by
    /// [`CafeDeleteMessages`]
    pub cursor: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CafeInboxMessage {
    pub id: ContentId,
    /// Sender of the message
    pub peer: PeerId,
    pub date: DateTime<Utc>,
    pub env: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CafeDeleteMessages {
    pub token: String,
    /// Delete messages up to and including this inbox position
    pub cursor: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CafeDeleteMessagesAck {
    pub more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: u16,
    pub message: String,
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub payload: Payload,
    /// Correlates a response with its request
    pub request_id: Option<u32>,
    pub is_response: bool,
}

/// A message signed by the sending peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message: Message,
    pub signer: PeerId,
    pub sig: Vec<u8>,
}

impl Envelope {
    /// Sign `payload` with the peer identity.
    pub fn new(
        identity: &Identity,
        payload: Payload,
        request_id: Option<u32>,
        is_response: bool,
    ) -> Result<Self, ProtocolError> {
        let message = Message {
            payload,
            request_id,
            is_response,
        };
        let bytes = bincode::serialize(&message)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        let sig = identity.sign(&bytes);

        Ok(Self {
            message,
            signer: identity.peer_id(),
            sig: sig.to_bytes().to_vec(),
        })
    }

    /// Check that this envelope was signed by `claimed`.
    pub fn verify(&self, claimed: &PeerId) -> Result<(), ProtocolError> {
        if self.signer != *claimed {
            return Err(ProtocolError::SignerMismatch {
                signer: self.signer.to_hex(),
                claimed: claimed.to_hex(),
            });
        }
        let bytes = bincode::serialize(&self.message)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        verify_signature_bytes(&claimed.0, &bytes, &self.sig)
            .map_err(|_| ProtocolError::BadSignature)
    }

    pub fn payload(&self) -> &Payload {
        &self.message.payload
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        bincode::deserialize(bytes).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}
