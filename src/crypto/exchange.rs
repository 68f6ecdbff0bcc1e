//! X25519 key agreement used by the reference authenticator to protect
//! session key transfer.

use rand::rngs::OsRng;
use thiserror::Error;
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};

use super::key::KeyMaterial;

/// Errors from key exchange operations
#[derive(Debug, Error)]
pub enum KeyExchangeError {
    /// Invalid public key
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Shared secret has not been computed yet
    #[error("Key exchange incomplete")]
    Incomplete,
}

/// X25519 public key (32 bytes)
#[derive(Clone, PartialEq, Eq)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    /// Create from bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create from a slice
    pub fn from_slice(slice: &[u8]) -> Result<Self, KeyExchangeError> {
        let bytes: [u8; 32] = slice.try_into().map_err(|_| {
            KeyExchangeError::InvalidPublicKey(format!("Expected 32 bytes, got {}", slice.len()))
        })?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PublicKey([{:02x}{:02x}{:02x}{:02x}...])",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// Ephemeral X25519 exchange for one handshake
pub struct KeyExchange {
    secret: StaticSecret,
    public: PublicKey,
    shared: Option<KeyMaterial>,
}

impl KeyExchange {
    /// Generate a fresh key pair
    pub fn new() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from_bytes(X25519Public::from(&secret).to_bytes());
        Self {
            secret,
            public,
            shared: None,
        }
    }

    /// Our public key to send to the peer
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// Set the peer's public key and compute the shared secret
    pub fn set_peer_public(&mut self, peer: &PublicKey) {
        let shared = self
            .secret
            .diffie_hellman(&X25519Public::from(*peer.as_bytes()));
        self.shared = Some(KeyMaterial::new(shared.as_bytes().to_vec()));
    }

    /// Derive a wrapping key bound to `context`
    pub fn derive_key(&self, context: &str) -> Result<KeyMaterial, KeyExchangeError> {
        let shared = self.shared.as_ref().ok_or(KeyExchangeError::Incomplete)?;
        shared
            .derive(context.as_bytes(), 32)
            .map_err(|e| KeyExchangeError::InvalidPublicKey(e.to_string()))
    }

    /// Check if key exchange is complete
    pub fn is_complete(&self) -> bool {
        self.shared.is_some()
    }
}

impl Default for KeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyExchange")
            .field("public", &self.public)
            .field("complete", &self.shared.is_some())
            .finish_non_exhaustive()
    }
}
