use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{IdentityError, ProtocolError};

// Peer identity = Ed25519 public key (32 bytes)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(into = "String", try_from = "String")]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        decode_key_hex(s)
            .map(Self)
            .ok_or_else(|| IdentityError::InvalidId(s.to_string()))
    }

    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for PeerId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<PeerId> for String {
    fn from(id: PeerId) -> Self {
        id.to_hex()
    }
}

impl TryFrom<String> for PeerId {
    type Error = IdentityError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_hex(&s)
    }
}

// Thread identity = public half of the thread keypair
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(into = "String", try_from = "String")]
pub struct ThreadId(pub [u8; 32]);

impl ThreadId {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, IdentityError> {
        decode_key_hex(s)
            .map(Self)
            .ok_or_else(|| IdentityError::InvalidId(s.to_string()))
    }

    pub fn short(&self) -> String {
        self.to_hex()[..8].to_string()
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for ThreadId {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<ThreadId> for String {
    fn from(id: ThreadId) -> Self {
        id.to_hex()
    }
}

impl TryFrom<String> for ThreadId {
    type Error = IdentityError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_hex(&s)
    }
}

/// Account address: `A` followed by the hex account public key.
///
/// Account seeds share the key material but use the `S` prefix; parsing a
/// seed as an address is rejected.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(into = "String", try_from = "String")]
pub struct Address(pub [u8; 32]);

impl Address {
    pub const PREFIX: char = 'A';

    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        if s.starts_with(crate::identity::SEED_PREFIX) {
            return Err(IdentityError::SeedAsAddress);
        }
        let hex_part = s
            .strip_prefix(Self::PREFIX)
            .ok_or_else(|| IdentityError::InvalidAddress(s.to_string()))?;
        decode_key_hex(hex_part)
            .map(Self)
            .ok_or_else(|| IdentityError::InvalidAddress(s.to_string()))
    }

    pub fn public_key_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", Self::PREFIX, hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        addr.to_string()
    }
}

impl TryFrom<String> for Address {
    type Error = IdentityError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

/// Content address of an immutable blob.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(into = "String", try_from = "String")]
pub struct ContentId(String);

impl ContentId {
    /// Address `data` by its hash.
    pub fn of(data: &[u8]) -> Self {
        Self(crate::crypto::content_hash(data))
    }

    pub fn parse(s: &str) -> Result<Self, ProtocolError> {
        if s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(Self(s.to_ascii_lowercase()))
        } else {
            Err(ProtocolError::InvalidContentId(s.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..8]
    }

    /// Whether `data` hashes to this id.
    pub fn matches(&self, data: &[u8]) -> bool {
        Self::of(data) == *self
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContentId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<ContentId> for String {
    fn from(id: ContentId) -> Self {
        id.0
    }
}

impl TryFrom<String> for ContentId {
    type Error = ProtocolError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

fn decode_key_hex(s: &str) -> Option<[u8; 32]> {
    let bytes = hex::decode(s).ok()?;
    bytes.try_into().ok()
}

/// Enumerations persisted as upper-case names and carried on the wire.
macro_rules! named_enum {
    ($(#[$meta:meta])* $name:ident, $kind:literal { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ProtocolError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ProtocolError::UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

named_enum!(
    /// Who may read, annotate and write a thread.
    ThreadType, "thread type" {
        Private => "PRIVATE",
        ReadOnly => "READ_ONLY",
        Public => "PUBLIC",
        Open => "OPEN",
    }
);

named_enum!(
    /// Who may invite others into a thread.
    ThreadSharing, "thread sharing" {
        NotShared => "NOT_SHARED",
        InviteOnly => "INVITE_ONLY",
        Shared => "SHARED",
    }
);

named_enum!(
    BlockType, "block type" {
        Merge => "MERGE",
        Ignore => "IGNORE",
        Flag => "FLAG",
        Join => "JOIN",
        Announce => "ANNOUNCE",
        Leave => "LEAVE",
        Message => "MESSAGE",
        Files => "FILES",
        Comment => "COMMENT",
        Like => "LIKE",
        Invite => "INVITE",
    }
);

named_enum!(
    CafeRequestType, "cafe request type" {
        Store => "STORE",
        StoreThread => "STORE_THREAD",
        UnstoreThread => "UNSTORE_THREAD",
        Inbox => "DELIVER_MESSAGE",
    }
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_rejects_seed() {
        let seed = format!("S{}", "ab".repeat(32));
        assert!(matches!(Address::parse(&seed), Err(IdentityError::SeedAsAddress)));
    }

    #[test]
    fn test_address_display_parse() {
        let addr = Address([9u8; 32]);
        let text = addr.to_string();
        assert!(text.starts_with('A'));
        assert_eq!(Address::parse(&text).unwrap(), addr);
    }

    #[test]
    fn test_content_id_validation() {
        let id = ContentId::of(b"block");
        assert!(ContentId::parse(id.as_str()).is_ok());
        assert!(ContentId::parse("not-a-cid").is_err());
        assert!(id.matches(b"block"));
        assert!(!id.matches(b"other"));
    }

    #[test]
    fn test_named_enum_text() {
        assert_eq!(BlockType::Merge.as_str(), "MERGE");
        assert_eq!("READ_ONLY".parse::<ThreadType>().unwrap(), ThreadType::ReadOnly);
        assert_eq!("DELIVER_MESSAGE".parse::<CafeRequestType>().unwrap(), CafeRequestType::Inbox);
        assert!("NOPE".parse::<ThreadSharing>().is_err());
    }

    #[test]
    fn test_peer_id_json_is_hex() {
        let peer = PeerId([1u8; 32]);
        let json = serde_json::to_string(&peer).unwrap();
        assert_eq!(json, format!("\"{}\"", "01".repeat(32)));
        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, peer);
    }
}
