//! Session key material.
//!
//! Uses HKDF (HMAC-based Key Derivation Function) to derive per-purpose
//! subkeys from the negotiated session key.

use std::fmt;

use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroize;

/// Errors from key material operations
#[derive(Debug, Error)]
pub enum KeyError {
    /// Key material is empty
    #[error("Key material is empty")]
    Empty,

    /// Key material is shorter than the algorithm needs
    #[error("Key too short: {actual} bytes (need {required})")]
    TooShort {
        /// Bytes available
        actual: usize,
        /// Bytes needed
        required: usize,
    },

    /// Key derivation failed
    #[error("Key derivation failed: {0}")]
    DerivationFailed(String),
}

/// Key material (secret bytes). Zeroized on drop, redacted in debug output.
#[derive(Clone)]
pub struct KeyMaterial {
    /// The raw key bytes
    bytes: Vec<u8>,
}

impl KeyMaterial {
    /// Create new key material from bytes
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Fill `len` bytes from the system CSPRNG
    pub fn random(len: usize) -> Self {
        let mut bytes = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Get the key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Get the key length
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Check if the key is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Derive a new key using HKDF-SHA256 (no salt)
    pub fn derive(&self, info: &[u8], output_len: usize) -> Result<KeyMaterial, KeyError> {
        use hkdf::Hkdf;
        use sha2::Sha256;

        if self.bytes.is_empty() {
            return Err(KeyError::Empty);
        }

        let hk = Hkdf::<Sha256>::new(None, &self.bytes);
        let mut okm = vec![0u8; output_len];

        hk.expand(info, &mut okm)
            .map_err(|e| KeyError::DerivationFailed(format!("HKDF expand failed: {}", e)))?;

        Ok(KeyMaterial::new(okm))
    }
}

impl PartialEq for KeyMaterial {
    fn eq(&self, other: &Self) -> bool {
        self.bytes.len() == other.bytes.len()
            && self
                .bytes
                .iter()
                .zip(other.bytes.iter())
                .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                == 0
    }
}

impl Eq for KeyMaterial {}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Don't leak key material in debug output
        write!(f, "KeyMaterial([REDACTED, {} bytes])", self.bytes.len())
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

/// A negotiated key together with the crypto method it was generated for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionKey {
    method: String,
    material: KeyMaterial,
}

impl SessionKey {
    /// Create a session key for `method`
    pub fn new(method: impl Into<String>, material: KeyMaterial) -> Self {
        Self {
            method: method.into(),
            material,
        }
    }

    /// Crypto method name (e.g. `CHACHA20`)
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Raw key material
    pub fn material(&self) -> &KeyMaterial {
        &self.material
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_material_debug_redacted() {
        let key = KeyMaterial::new(vec![0x42u8; 32]);
        let debug = format!("{:?}", key);
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("42"));
    }

    #[test]
    fn test_random_keys_differ() {
        let a = KeyMaterial::random(32);
        let b = KeyMaterial::random(32);
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_derive_domain_separation() {
        let key = KeyMaterial::new(vec![7u8; 32]);
        let enc = key.derive(b"secman/v1/encryption", 32).unwrap();
        let mac = key.derive(b"secman/v1/integrity", 32).unwrap();
        assert_ne!(enc, mac);
        assert_eq!(enc, key.derive(b"secman/v1/encryption", 32).unwrap());
    }

    #[test]
    fn test_derive_empty_key_rejected() {
        let key = KeyMaterial::new(Vec::new());
        assert!(matches!(key.derive(b"x", 32), Err(KeyError::Empty)));
    }

    #[test]
    fn test_derive_exceeds_max_length() {
        let key = KeyMaterial::new(vec![1u8; 32]);
        // HKDF-SHA256 output is capped at 255 * 32 bytes
        assert!(key.derive(b"x", 255 * 32 + 1).is_err());
    }

    /// RFC 5869 Appendix A.3: SHA-256 with zero-length salt and info.
    #[test]
    fn test_rfc5869_case3_zero_salt() {
        use hex_literal::hex;

        let ikm = KeyMaterial::new(hex!("0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b0b").to_vec());
        let expected = hex!(
            "8da4e775a563c18f715f802a063c5a31"
            "b8a11f5c5ee1879ec3454e5f3c738d2d"
            "9d201395faa4b61a96c8"
        );

        let okm = ikm.derive(b"", expected.len()).unwrap();
        assert_eq!(okm.as_bytes(), &expected[..]);
    }
}
