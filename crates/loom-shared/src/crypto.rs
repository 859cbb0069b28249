use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::RngCore;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::constants::{KDF_CONTEXT_SEAL, KDF_CONTEXT_THREAD_KEY, NONCE_SIZE, PUBKEY_SIZE};
use crate::error::CryptoError;

pub type SymmetricKey = [u8; 32];

pub fn generate_symmetric_key() -> SymmetricKey {
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

pub fn generate_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

// Returns nonce || ciphertext (24 bytes nonce prepended)
pub fn encrypt(key: &SymmetricKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce_bytes = generate_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut output = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    output.extend_from_slice(&nonce_bytes);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

pub fn decrypt(key: &SymmetricKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
    let cipher = XChaCha20Poly1305::new(key.into());
    let nonce = XNonce::from_slice(nonce_bytes);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// Symmetric block key of a thread, derived from its secret key.
pub fn derive_thread_key(thread_secret: &[u8; 32]) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_THREAD_KEY);
    hasher.update(thread_secret);
    *hasher.finalize().as_bytes()
}

fn derive_seal_key(shared_secret: &[u8], ephemeral_public: &[u8]) -> SymmetricKey {
    let mut hasher = blake3::Hasher::new_derive_key(KDF_CONTEXT_SEAL);
    hasher.update(shared_secret);
    hasher.update(ephemeral_public);
    *hasher.finalize().as_bytes()
}

/// Encrypt `plaintext` so that only the holder of the Ed25519 secret behind
/// `recipient` can read it.
///
/// The Ed25519 key is mapped to its X25519 form and combined with a fresh
/// ephemeral key. Output: ephemeral public key (32) || nonce || ciphertext.
pub fn seal(recipient: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let verifying_key =
        VerifyingKey::from_bytes(recipient).map_err(|_| CryptoError::InvalidPublicKey)?;
    let their_public = X25519PublicKey::from(verifying_key.to_montgomery().to_bytes());

    let ephemeral = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let ephemeral_public = X25519PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(&their_public);

    let key = derive_seal_key(shared.as_bytes(), ephemeral_public.as_bytes());
    let ciphertext = encrypt(&key, plaintext)?;

    let mut output = Vec::with_capacity(PUBKEY_SIZE + ciphertext.len());
    output.extend_from_slice(ephemeral_public.as_bytes());
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

/// Reverse of [`seal`] using the recipient's Ed25519 signing key.
pub fn open(signing_key: &SigningKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < PUBKEY_SIZE + NONCE_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let (ephemeral_bytes, ciphertext) = data.split_at(PUBKEY_SIZE);
    let mut ephemeral = [0u8; PUBKEY_SIZE];
    ephemeral.copy_from_slice(ephemeral_bytes);
    let ephemeral_public = X25519PublicKey::from(ephemeral);

    let secret = StaticSecret::from(signing_key.to_scalar_bytes());
    let shared = secret.diffie_hellman(&ephemeral_public);

    let key = derive_seal_key(shared.as_bytes(), ephemeral_public.as_bytes());
    decrypt(&key, ciphertext)
}

/// Content address of a byte blob (hex BLAKE3).
pub fn content_hash(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}
