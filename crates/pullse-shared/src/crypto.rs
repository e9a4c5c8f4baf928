use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::constants::NONCE_SIZE;
use crate::error::CryptoError;

pub type SymmetricKey = [u8; 32];

pub fn generate_conversation_key() -> SymmetricKey {
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

/// Ciphertext envelope as persisted and transmitted.
///
/// The raw `nonce || ciphertext` bytes are base64-encoded so the envelope
/// survives JSON storage and the JSON wire protocol untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CipherEnvelope {
    pub ciphertext: String,
}

impl CipherEnvelope {
    /// Encrypt `plaintext` into a fresh envelope.
    pub fn seal(key: &SymmetricKey, plaintext: &[u8]) -> Result<Self, CryptoError> {
        let data = encrypt(key, plaintext)?;
        Ok(Self {
            ciphertext: BASE64.encode(data),
        })
    }

    /// Decrypt the envelope back to plaintext bytes.
    pub fn open(&self, key: &SymmetricKey) -> Result<Vec<u8>, CryptoError> {
        let data = BASE64
            .decode(&self.ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)?;
        decrypt(key, &data)
    }
}
