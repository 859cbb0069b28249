//! Thread blocks and their codec.
//!
//! A block is serialized as a [`WireBlock`]: the header, a type tag and an
//! optional type-specific payload, signed by the authoring account. The
//! serialized form is then encrypted, except for MERGE blocks, which are
//! stored in plaintext and carry neither author, address nor signature. Two peers merging the same pair of heads therefore
//! produce byte-identical merges with the same content id.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{CodecError, CryptoError};
use crate::identity::{verify_signature_bytes, Account};
use crate::protocol::Peer;
use crate::types::{Address, BlockType, ContentId, PeerId, ThreadSharing, ThreadType};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockHeader {
    pub date: DateTime<Utc>,
    pub parents: Vec<ContentId>,
    /// Authoring peer, absent on merges
    pub author: Option<PeerId>,
    /// Authoring account, absent on merges
    pub address: Option<Address>,
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TargetPayload {
    pub target: ContentId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessagePayload {
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommentPayload {
    pub target: ContentId,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilesPayload {
    /// Root of the file set
    pub target: ContentId,
    pub caption: String,
    /// Decryption keys by file path
    pub keys: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JoinPayload {
    pub inviter: Option<PeerId>,
    pub peer: Peer,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnnouncePayload {
    pub peer: Option<Peer>,
    /// New thread name, honoured from the initiator only
    pub name: Option<String>,
}

/// Everything an invitee needs to reconstruct the thread.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvitePayload {
    pub secret: [u8; 32],
    pub key: String,
    pub name: String,
    pub schema: Option<ContentId>,
    pub initiator: Address,
    pub thread_type: ThreadType,
    pub sharing: ThreadSharing,
    pub whitelist: Vec<Address>,
}

/// Typed block body, one variant per block type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockBody {
    Merge,
    Ignore(TargetPayload),
    Flag(TargetPayload),
    Join(JoinPayload),
    Announce(AnnouncePayload),
    Leave,
    Message(MessagePayload),
    Files(FilesPayload),
    Comment(CommentPayload),
    Like(TargetPayload),
    Invite(InvitePayload),
}

impl BlockBody {
    pub fn block_type(&self) -> BlockType {
        match self {
            BlockBody::Merge => BlockType::Merge,
            BlockBody::Ignore(_) => BlockType::Ignore,
            BlockBody::Flag(_) => BlockType::Flag,
            BlockBody::Join(_) => BlockType::Join,
            BlockBody::Announce(_) => BlockType::Announce,
            BlockBody::Leave => BlockType::Leave,
            BlockBody::Message(_) => BlockType::Message,
            BlockBody::Files(_) => BlockType::Files,
            BlockBody::Comment(_) => BlockType::Comment,
            BlockBody::Like(_) => BlockType::Like,
            BlockBody::Invite(_) => BlockType::Invite,
        }
    }

    /// The block this body annotates, if any.
    pub fn target(&self) -> Option<&ContentId> {
        match self {
            BlockBody::Ignore(p) | BlockBody::Flag(p) | BlockBody::Like(p) => Some(&p.target),
            BlockBody::Comment(p) => Some(&p.target),
            BlockBody::Files(p) => Some(&p.target),
            _ => None,
        }
    }

    /// Free text carried by the body, if any.
    pub fn text(&self) -> Option<&str> {
        match self {
            BlockBody::Message(p) => Some(&p.body),
            BlockBody::Comment(p) => Some(&p.body),
            BlockBody::Files(p) => Some(&p.caption),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireBlock {
    header: BlockHeader,
    block_type: BlockType,
    payload: Option<Vec<u8>>,
    /// Account signature over the unsigned wire form
    signature: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadBlock {
    pub header: BlockHeader,
    pub body: BlockBody,
    pub signature: Option<Vec<u8>>,
}

impl ThreadBlock {
    pub fn new(header: BlockHeader, body: BlockBody) -> Self {
        Self {
            header,
            body,
            signature: None,
        }
    }

    pub fn block_type(&self) -> BlockType {
        self.body.block_type()
    }

    /// Sign header and payload with `account`, which must be the header's
    /// address.
    pub fn sign(mut self, account: &Account) -> Result<Self, CodecError> {
        if self.header.address != Some(account.address()) {
            return Err(CodecError::Invalid("signing account is not the block address".to_string()));
        }
        let message = self.wire(None)?;
        self.signature = Some(account.sign(&to_vec(&message)?).to_bytes().to_vec());
        Ok(self)
    }

    /// Check that the block was signed by the account in its header.
    pub fn verify_signature(&self) -> Result<(), CodecError> {
        let kind = self.block_type();
        let address = self
            .header
            .address
            .ok_or_else(|| CodecError::Invalid(format!("{kind} block without address")))?;
        let signature = self
            .signature
            .as_deref()
            .ok_or_else(|| CodecError::Invalid(format!("unsigned {kind} block")))?;

        let message = to_vec(&self.wire(None)?)?;
        verify_signature_bytes(&address.0, &message, signature)
            .map_err(|_| CodecError::BadSignature(address.to_string()))
    }

    fn wire(&self, signature: Option<Vec<u8>>) -> Result<WireBlock, CodecError> {
        let payload = match &self.body {
            BlockBody::Merge | BlockBody::Leave => None,
            BlockBody::Ignore(p) | BlockBody::Flag(p) | BlockBody::Like(p) => Some(to_vec(p)?),
            BlockBody::Join(p) => Some(to_vec(p)?),
            BlockBody::Announce(p) => Some(to_vec(p)?),
            BlockBody::Message(p) => Some(to_vec(p)?),
            BlockBody::Files(p) => Some(to_vec(p)?),
            BlockBody::Comment(p) => Some(to_vec(p)?),
            BlockBody::Invite(p) => Some(to_vec(p)?),
        };
        Ok(WireBlock {
            header: self.header.clone(),
            block_type: self.block_type(),
            payload,
            signature,
        })
    }

    /// Serialize to the plaintext wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        to_vec(&self.wire(self.signature.clone())?)
    }

    /// Parse the plaintext wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let wire: WireBlock = from_slice(bytes)?;
        let kind = wire.block_type;
        let payload = wire.payload.as_deref();

        let body = match kind {
            BlockType::Merge => BlockBody::Merge,
            BlockType::Leave => BlockBody::Leave,
            BlockType::Ignore => BlockBody::Ignore(required(kind, payload)?),
            BlockType::Flag => BlockBody::Flag(required(kind, payload)?),
            BlockType::Like => BlockBody::Like(required(kind, payload)?),
            BlockType::Join => BlockBody::Join(required(kind, payload)?),
            BlockType::Announce => BlockBody::Announce(required(kind, payload)?),
            BlockType::Message => BlockBody::Message(required(kind, payload)?),
            BlockType::Files => BlockBody::Files(required(kind, payload)?),
            BlockType::Comment => BlockBody::Comment(required(kind, payload)?),
            BlockType::Invite => BlockBody::Invite(required(kind, payload)?),
        };

        if kind != BlockType::Merge && wire.header.author.is_none() {
            return Err(CodecError::Invalid(format!("{kind} block without author")));
        }

        Ok(Self {
            header: wire.header,
            body,
            signature: wire.signature,
        })
    }
}

/// Encode a block, encrypting it with `encrypt` unless it is a MERGE.
pub fn encode<F>(block: &ThreadBlock, encrypt: F) -> Result<Vec<u8>, CodecError>
where
    F: FnOnce(&[u8]) -> Result<Vec<u8>, CryptoError>,
{
    let plaintext = block.to_bytes()?;
    if block.block_type() == BlockType::Merge {
        return Ok(plaintext);
    }
    Ok(encrypt(&plaintext)?)
}

/// Decode a block. When `decrypt` fails the bytes are parsed as plaintext,
/// which is accepted only for MERGE blocks.
pub fn decode<F>(ciphertext: &[u8], decrypt: F) -> Result<ThreadBlock, CodecError>
where
    F: FnOnce(&[u8]) -> Result<Vec<u8>, CryptoError>,
{
    match decrypt(ciphertext) {
        Ok(plaintext) => ThreadBlock::from_bytes(&plaintext),
        Err(err) => {
            let block = ThreadBlock::from_bytes(ciphertext).map_err(|_| CodecError::Crypto(err))?;
            if block.block_type() != BlockType::Merge {
                return Err(CodecError::Invalid(format!(
                    "plaintext {} block",
                    block.block_type()
                )));
            }
            Ok(block)
        }
    }
}

fn required<T: DeserializeOwned>(kind: BlockType, payload: Option<&[u8]>) -> Result<T, CodecError> {
    let bytes = payload.ok_or(CodecError::MissingPayload(kind))?;
    from_slice(bytes)
}

fn to_vec<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    bincode::serialize(value).map_err(|e| CodecError::Serialization(e.to_string()))
}

fn from_slice<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    bincode::deserialize(bytes).map_err(|e| CodecError::Serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{decrypt, encrypt, generate_symmetric_key};

    fn header(author: bool) -> BlockHeader {
        BlockHeader {
            date: Utc::now(),
            parents: vec![ContentId::of(b"parent")],
            author: author.then_some(PeerId([1u8; 32])),
            address: author.then_some(Address([2u8; 32])),
        }
    }

    fn message(text: &str) -> ThreadBlock {
        ThreadBlock::new(
            header(true),
            BlockBody::Message(MessagePayload {
                body: text.to_string(),
            }),
        )
    }

    #[test]
    fn test_encrypted_block_decodes_with_thread_key() {
        let key = generate_symmetric_key();
        let block = message("hello");

        let ciphertext = encode(&block, |p| encrypt(&key, p)).unwrap();
        let decoded = decode(&ciphertext, |c| decrypt(&key, c)).unwrap();

        assert_eq!(decoded, block);
    }

    #[test]
    fn test_wrong_key_rejects_non_merge() {
        let key = generate_symmetric_key();
        let other = generate_symmetric_key();
        let ciphertext = encode(&message("hello"), |p| encrypt(&key, p)).unwrap();

        assert!(decode(&ciphertext, |c| decrypt(&other, c)).is_err());
    }

    #[test]
    fn test_merge_is_plaintext_and_deterministic() {
        let key = generate_symmetric_key();
        let merge = ThreadBlock::new(header(false), BlockBody::Merge);

        let a = encode(&merge, |p| encrypt(&key, p)).unwrap();
        let b = encode(&merge, |p| encrypt(&key, p)).unwrap();
        assert_eq!(a, b);

        // Readable without the thread key
        let other = generate_symmetric_key();
        let decoded = decode(&a, |c| decrypt(&other, c)).unwrap();
        assert_eq!(decoded.block_type(), BlockType::Merge);
    }

    #[test]
    fn test_plaintext_message_rejected() {
        let key = generate_symmetric_key();
        let plaintext = message("sneaky").to_bytes().unwrap();

        let err = decode(&plaintext, |c| decrypt(&key, c)).unwrap_err();
        assert!(matches!(err, CodecError::Invalid(_)));
    }

    #[test]
    fn test_missing_payload_rejected() {
        let wire = WireBlock {
            header: header(true),
            block_type: BlockType::Comment,
            payload: None,
            signature: None,
        };
        let bytes = bincode::serialize(&wire).unwrap();

        assert!(matches!(
            ThreadBlock::from_bytes(&bytes),
            Err(CodecError::MissingPayload(BlockType::Comment))
        ));
    }

    #[test]
    fn test_leave_without_payload_accepted() {
        let wire = WireBlock {
            header: header(true),
            block_type: BlockType::Leave,
            payload: None,
            signature: None,
        };
        let bytes = bincode::serialize(&wire).unwrap();

        assert_eq!(ThreadBlock::from_bytes(&bytes).unwrap().body, BlockBody::Leave);
    }

    #[test]
    fn test_signed_block_survives_encryption() {
        let key = generate_symmetric_key();
        let account = Account::generate();
        let mut block = message("signed");
        block.header.address = Some(account.address());
        let block = block.sign(&account).unwrap();

        let ciphertext = encode(&block, |p| encrypt(&key, p)).unwrap();
        let decoded = decode(&ciphertext, |c| decrypt(&key, c)).unwrap();

        assert!(decoded.verify_signature().is_ok());
    }

    #[test]
    fn test_forged_address_fails_verification() {
        let author = Account::generate();
        let victim = Account::generate();
        let mut block = message("forged");
        block.header.address = Some(author.address());
        let mut block = block.sign(&author).unwrap();

        block.header.address = Some(victim.address());
        assert!(matches!(block.verify_signature(), Err(CodecError::BadSignature(_))));

        block.signature = None;
        assert!(matches!(block.verify_signature(), Err(CodecError::Invalid(_))));
    }

    #[test]
    fn test_sign_requires_header_account() {
        let block = message("mismatch");
        assert!(block.sign(&Account::generate()).is_err());
    }
}
