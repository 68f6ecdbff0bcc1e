//! ChaCha20-Poly1305 AEAD encryption for protected frames.
//!
//! The nonce is prepended to the ciphertext; the auth tag is appended by
//! the cipher.

use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::RngCore;
use thiserror::Error;

use super::key::KeyMaterial;
use super::{AEAD_TAG_SIZE, MIN_KEY_SIZE, NONCE_SIZE};

/// Errors from AEAD operations
#[derive(Debug, Error)]
pub enum AeadError {
    /// Invalid key
    #[error("Invalid AEAD key: {0}")]
    InvalidKey(String),

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed (auth tag mismatch or corrupted data)
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Data too short
    #[error("Ciphertext too short")]
    DataTooShort,
}

/// ChaCha20-Poly1305 cipher for authenticated encryption
pub struct AeadCipher {
    cipher: ChaCha20Poly1305,
}

impl fmt::Debug for AeadCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AeadCipher").finish_non_exhaustive()
    }
}

impl AeadCipher {
    /// Create a new AEAD cipher with the given key (first 32 bytes are used)
    pub fn new(key: &KeyMaterial) -> Result<Self, AeadError> {
        if key.len() < MIN_KEY_SIZE {
            return Err(AeadError::InvalidKey(format!(
                "Key too short: {} bytes (need {})",
                key.len(),
                MIN_KEY_SIZE
            )));
        }
        let cipher = ChaCha20Poly1305::new_from_slice(&key.as_bytes()[..MIN_KEY_SIZE])
            .map_err(|e| AeadError::InvalidKey(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Encrypt plaintext with the given nonce and associated data
    ///
    /// Returns: nonce || ciphertext || tag
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        nonce: &[u8; NONCE_SIZE],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, AeadError> {
        let payload = Payload {
            msg: plaintext,
            aad: associated_data,
        };

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(nonce), payload)
            .map_err(|e| AeadError::EncryptionFailed(e.to_string()))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(nonce);
        result.extend_from_slice(&ciphertext);

        Ok(result)
    }

    /// Encrypt with a fresh random nonce
    pub fn encrypt_auto_nonce(
        &self,
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, AeadError> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        self.encrypt(plaintext, &nonce, associated_data)
    }

    /// Decrypt ciphertext
    ///
    /// Input format: nonce || ciphertext || tag
    pub fn decrypt(
        &self,
        ciphertext_with_nonce: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>, AeadError> {
        if ciphertext_with_nonce.len() < NONCE_SIZE + AEAD_TAG_SIZE {
            return Err(AeadError::DataTooShort);
        }

        let (nonce, ciphertext) = ciphertext_with_nonce.split_at(NONCE_SIZE);
        let payload = Payload {
            msg: ciphertext,
            aad: associated_data,
        };

        self.cipher
            .decrypt(Nonce::from_slice(nonce), payload)
            .map_err(|e| AeadError::DecryptionFailed(e.to_string()))
    }
}
