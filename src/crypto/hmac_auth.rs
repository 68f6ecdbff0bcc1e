//! HMAC-SHA256 message authentication for integrity-only frames.
//!
//! The tag is appended to the payload.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

use super::key::KeyMaterial;
use super::HMAC_TAG_SIZE;

type HmacSha256 = Hmac<Sha256>;

/// Errors from HMAC operations
#[derive(Debug, Error)]
pub enum HmacError {
    /// Invalid key
    #[error("Invalid HMAC key: {0}")]
    InvalidKey(String),

    /// Tag verification failed
    #[error("HMAC verification failed")]
    VerificationFailed,

    /// Data too short
    #[error("Data too short for HMAC tag")]
    DataTooShort,
}

/// HMAC-SHA256 authenticator
#[derive(Debug)]
pub struct HmacAuth {
    key: KeyMaterial,
}

impl HmacAuth {
    /// Create a new HMAC authenticator with the given key
    pub fn new(key: KeyMaterial) -> Result<Self, HmacError> {
        if key.len() < 16 {
            return Err(HmacError::InvalidKey(format!(
                "Key too short: {} bytes (minimum 16)",
                key.len()
            )));
        }
        Ok(Self { key })
    }

    fn mac(&self) -> Result<HmacSha256, HmacError> {
        HmacSha256::new_from_slice(self.key.as_bytes())
            .map_err(|e| HmacError::InvalidKey(e.to_string()))
    }

    /// Compute HMAC-SHA256 tag for data
    pub fn compute_tag(&self, data: &[u8]) -> Result<[u8; HMAC_TAG_SIZE], HmacError> {
        let mut mac = self.mac()?;
        mac.update(data);

        let mut tag = [0u8; HMAC_TAG_SIZE];
        tag.copy_from_slice(&mac.finalize().into_bytes());
        Ok(tag)
    }

    /// Verify HMAC tag in constant time
    pub fn verify_tag(&self, data: &[u8], tag: &[u8]) -> Result<(), HmacError> {
        let mut mac = self.mac()?;
        mac.update(data);
        mac.verify_slice(tag)
            .map_err(|_| HmacError::VerificationFailed)
    }

    /// Sign data by appending HMAC tag
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, HmacError> {
        let tag = self.compute_tag(data)?;
        let mut result = Vec::with_capacity(data.len() + HMAC_TAG_SIZE);
        result.extend_from_slice(data);
        result.extend_from_slice(&tag);
        Ok(result)
    }

    /// Verify and return data without tag
    pub fn verify(&self, signed_data: &[u8]) -> Result<Vec<u8>, HmacError> {
        if signed_data.len() < HMAC_TAG_SIZE {
            return Err(HmacError::DataTooShort);
        }

        let (data, tag) = signed_data.split_at(signed_data.len() - HMAC_TAG_SIZE);
        self.verify_tag(data, tag)?;
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> HmacAuth {
        HmacAuth::new(KeyMaterial::new(vec![0x11u8; 32])).unwrap()
    }

    #[test]
    fn test_sign_verify() {
        let signed = auth().sign(b"ValidCommands").unwrap();
        assert_eq!(signed.len(), 13 + HMAC_TAG_SIZE);
        assert_eq!(auth().verify(&signed).unwrap(), b"ValidCommands");
    }

    #[test]
    fn test_tamper_detected() {
        let mut signed = auth().sign(b"ValidCommands").unwrap();
        signed[0] ^= 1;
        assert!(matches!(
            auth().verify(&signed),
            Err(HmacError::VerificationFailed)
        ));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let signed = auth().sign(b"data").unwrap();
        let other = HmacAuth::new(KeyMaterial::new(vec![0x22u8; 32])).unwrap();
        assert!(other.verify(&signed).is_err());
    }

    #[test]
    fn test_short_inputs() {
        assert!(HmacAuth::new(KeyMaterial::new(vec![0u8; 8])).is_err());
        assert!(matches!(
            auth().verify(&[0u8; 4]),
            Err(HmacError::DataTooShort)
        ));
    }
}
