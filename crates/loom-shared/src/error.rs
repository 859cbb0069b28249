use thiserror::Error;

use crate::types::BlockType;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed: invalid ciphertext or wrong key")]
    DecryptionFailed,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Invalid public key")]
    InvalidPublicKey,
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Signature verification failed")]
    InvalidSignature,

    #[error("Account seeds are not addresses")]
    SeedAsAddress,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid seed")]
    InvalidSeed,

    #[error("Invalid id: {0}")]
    InvalidId(String),

    #[error("Key file error: {0}")]
    KeyFile(String),
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("Invalid content id: {0}")]
    InvalidContentId(String),

    #[error("Envelope signer {signer} does not match peer {claimed}")]
    SignerMismatch { signer: String, claimed: String },

    #[error("Envelope signature invalid")]
    BadSignature,
}

/// Errors produced while encoding or decoding a thread block.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Block serialization error: {0}")]
    Serialization(String),

    #[error("Invalid block: missing payload for {0}")]
    MissingPayload(BlockType),

    #[error("Invalid block: {0}")]
    Invalid(String),

    #[error("Block encryption failed: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Block signature does not match account {0}")]
    BadSignature(String),
}

/// Session token validation failures. `NoToken` and `Expired` mean the
/// caller may refresh; `Invalid` means it must not.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenError {
    #[error("no token found")]
    NoToken,

    #[error("token expired")]
    Expired,

    #[error("token invalid")]
    Invalid,
}
