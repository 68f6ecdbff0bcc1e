//! Pluggable cipher capability and the default ChaCha20 suite.

use std::fmt;

use super::aead::AeadCipher;
use super::hmac_auth::HmacAuth;
use super::key::{KeyMaterial, SessionKey};
use super::{CryptoError, MIN_KEY_SIZE, SESSION_KEY_SIZE};

/// Method name of the default suite
pub const CHACHA20: &str = "CHACHA20";

const ENCRYPTION_INFO: &[u8] = b"secman/v1/encryption";
const INTEGRITY_INFO: &[u8] = b"secman/v1/integrity";
const SHARED_SECRET_INFO: &[u8] = b"secman/v1/shared-secret";

/// Symmetric primitives behind a negotiated crypto method.
pub trait CipherCapability: Send + Sync + fmt::Debug {
    /// Whether `method` is implemented (case-insensitive)
    fn supports(&self, method: &str) -> bool;

    /// Generate a fresh random key for `method`
    fn generate_key(&self, method: &str) -> Result<SessionKey, CryptoError>;

    /// Deterministically derive a key for `method` from a pre-shared secret
    fn key_from_secret(&self, method: &str, secret: &[u8]) -> Result<SessionKey, CryptoError>;

    /// Encrypt and authenticate `plaintext`
    fn seal(&self, key: &SessionKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Reverse [`CipherCapability::seal`]
    fn open(&self, key: &SessionKey, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Append an integrity tag to `data`
    fn sign(&self, key: &SessionKey, data: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Check and strip the integrity tag
    fn verify(&self, key: &SessionKey, signed: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Keep only the methods this capability implements, preserving order
    fn filter_methods(&self, methods: &[String]) -> Vec<String> {
        methods
            .iter()
            .filter(|m| self.supports(m))
            .cloned()
            .collect()
    }
}

/// ChaCha20-Poly1305 for confidentiality, HMAC-SHA256 for integrity.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChaChaCipher;

impl ChaChaCipher {
    /// Create the default suite
    pub fn new() -> Self {
        Self
    }

    fn check(&self, key: &SessionKey) -> Result<(), CryptoError> {
        if self.supports(key.method()) {
            Ok(())
        } else {
            Err(CryptoError::UnsupportedMethod(key.method().to_string()))
        }
    }

    fn aead(&self, key: &SessionKey) -> Result<AeadCipher, CryptoError> {
        self.check(key)?;
        let subkey = key.material().derive(ENCRYPTION_INFO, MIN_KEY_SIZE)?;
        Ok(AeadCipher::new(&subkey)?)
    }

    fn hmac(&self, key: &SessionKey) -> Result<HmacAuth, CryptoError> {
        self.check(key)?;
        let subkey = key.material().derive(INTEGRITY_INFO, MIN_KEY_SIZE)?;
        Ok(HmacAuth::new(subkey)?)
    }
}

impl CipherCapability for ChaChaCipher {
    fn supports(&self, method: &str) -> bool {
        method.eq_ignore_ascii_case(CHACHA20)
    }

    fn generate_key(&self, method: &str) -> Result<SessionKey, CryptoError> {
        if !self.supports(method) {
            return Err(CryptoError::UnsupportedMethod(method.to_string()));
        }
        Ok(SessionKey::new(
            CHACHA20,
            KeyMaterial::random(SESSION_KEY_SIZE),
        ))
    }

    fn key_from_secret(&self, method: &str, secret: &[u8]) -> Result<SessionKey, CryptoError> {
        if !self.supports(method) {
            return Err(CryptoError::UnsupportedMethod(method.to_string()));
        }
        let material =
            KeyMaterial::new(secret.to_vec()).derive(SHARED_SECRET_INFO, SESSION_KEY_SIZE)?;
        Ok(SessionKey::new(CHACHA20, material))
    }

    fn seal(&self, key: &SessionKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(self.aead(key)?.encrypt_auto_nonce(plaintext, aad)?)
    }

    fn open(&self, key: &SessionKey, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(self.aead(key)?.decrypt(sealed, aad)?)
    }

    fn sign(&self, key: &SessionKey, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(self.hmac(key)?.sign(data)?)
    }

    fn verify(&self, key: &SessionKey, signed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(self.hmac(key)?.verify(signed)?)
    }
}
