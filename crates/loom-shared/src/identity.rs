use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::error::{CryptoError, IdentityError};
use crate::types::{Address, PeerId};

/// Prefix of an account seed in its text form.
pub const SEED_PREFIX: char = 'S';

/// A node's network identity based on Ed25519.
/// The public key serves as the peer id.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
}

/// Serializable format for storing/exporting an identity
#[derive(Serialize, Deserialize)]
pub struct IdentityExport {
    pub secret_key: [u8; 32],
    pub public_key: [u8; 32],
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Restore identity from secret key bytes
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        Self { signing_key }
    }

    /// Restore identity from a hex-encoded secret key
    pub fn from_secret_hex(hex_str: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(hex_str.trim()).map_err(|e| IdentityError::KeyFile(e.to_string()))?;
        let secret: [u8; 32] = bytes.try_into().map_err(|_| IdentityError::InvalidKeyBytes)?;
        Ok(Self::from_secret_bytes(&secret))
    }

    /// Get the peer id (public key)
    pub fn peer_id(&self) -> PeerId {
        PeerId(self.signing_key.verifying_key().to_bytes())
    }

    /// Get the raw public key bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Get the raw secret key bytes
    pub fn secret_bytes(&self) -> &[u8; 32] {
        self.signing_key.as_bytes()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Get the verifying (public) key
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Decrypt data sealed to this identity's public key
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        crypto::open(&self.signing_key, sealed)
    }

    /// Export identity for serialization
    pub fn to_export(&self) -> IdentityExport {
        IdentityExport {
            secret_key: *self.signing_key.as_bytes(),
            public_key: self.signing_key.verifying_key().to_bytes(),
        }
    }
}

/// The user-level key. Its public half is the account address that thread
/// whitelists and registration challenges refer to; its text-form secret is
/// the seed, which must never be shared.
#[derive(Clone)]
pub struct Account {
    signing_key: SigningKey,
}

impl Account {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore an account from its `S`-prefixed seed.
    pub fn from_seed(seed: &str) -> Result<Self, IdentityError> {
        let hex_part = seed
            .trim()
            .strip_prefix(SEED_PREFIX)
            .ok_or(IdentityError::InvalidSeed)?;
        let bytes = hex::decode(hex_part).map_err(|_| IdentityError::InvalidSeed)?;
        let secret: [u8; 32] = bytes.try_into().map_err(|_| IdentityError::InvalidSeed)?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&secret),
        })
    }

    pub fn seed(&self) -> String {
        format!("{}{}", SEED_PREFIX, hex::encode(self.signing_key.as_bytes()))
    }

    pub fn address(&self) -> Address {
        Address(self.signing_key.verifying_key().to_bytes())
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Encrypt data so only this account can read it back
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        crypto::seal(&self.address().0, plaintext)
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        crypto::open(&self.signing_key, sealed)
    }
}

/// Whether `text` has the shape of an account seed.
pub fn is_seed(text: &str) -> bool {
    Account::from_seed(text).is_ok()
}

/// Verify a signature against a public key
pub fn verify_signature(
    pubkey_bytes: &[u8; 32],
    message: &[u8],
    signature: &Signature,
) -> Result<(), IdentityError> {
    let verifying_key =
        VerifyingKey::from_bytes(pubkey_bytes).map_err(|_| IdentityError::InvalidKeyBytes)?;
    verifying_key
        .verify(message, signature)
        .map_err(|_| IdentityError::InvalidSignature)
}

/// Verify a raw signature slice, as carried in protocol messages
pub fn verify_signature_bytes(
    pubkey_bytes: &[u8; 32],
    message: &[u8],
    signature: &[u8],
) -> Result<(), IdentityError> {
    let signature = Signature::from_slice(signature).map_err(|_| IdentityError::InvalidSignature)?;
    verify_signature(pubkey_bytes, message, &signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_roundtrip() {
        let id = Identity::generate();
        let export = id.to_export();
        let restored = Identity::from_secret_bytes(&export.secret_key);
        assert_eq!(id.peer_id(), restored.peer_id());

        let from_hex = Identity::from_secret_hex(&hex::encode(id.secret_bytes())).unwrap();
        assert_eq!(from_hex.peer_id(), id.peer_id());
    }

    #[test]
    fn test_sign_verify() {
        let id = Identity::generate();
        let message = b"Hello, loom!";
        let signature = id.sign(message);

        assert!(verify_signature(&id.public_key_bytes(), message, &signature).is_ok());

        // Wrong message should fail
        assert!(verify_signature(&id.public_key_bytes(), b"wrong", &signature).is_err());
    }

    #[test]
    fn test_account_seed_roundtrip() {
        let account = Account::generate();
        let seed = account.seed();
        assert!(is_seed(&seed));
        assert!(!is_seed(&account.address().to_string()));

        let restored = Account::from_seed(&seed).unwrap();
        assert_eq!(restored.address(), account.address());
    }

    #[test]
    fn test_account_seal_open() {
        let account = Account::generate();
        let sealed = account.seal(b"thread backup").unwrap();
        assert_eq!(account.open(&sealed).unwrap(), b"thread backup");
        assert!(Account::generate().open(&sealed).is_err());
    }
}
