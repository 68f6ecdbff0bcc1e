//! Cryptographic capability used by the negotiation engine.
//!
//! The engine never touches primitives directly: it asks a
//! [`CipherCapability`] to generate session keys for a negotiated crypto
//! method and to seal, open, sign and verify frames with them. The default
//! [`ChaChaCipher`] implements method `CHACHA20`:
//!
//! ```text
//! session key (32 random bytes, or HKDF of a shared secret)
//!     │
//!     ├─[HKDF "secman/v1/encryption"]─► ChaCha20-Poly1305 key
//!     └─[HKDF "secman/v1/integrity"]──► HMAC-SHA256 key
//! ```
//!
//! Sealed payloads are `nonce:12 || ciphertext || tag:16`; signed payloads
//! are `data || hmac:32`.

mod aead;
mod cipher;
mod exchange;
mod hmac_auth;
mod key;

pub use aead::{AeadCipher, AeadError};
pub use cipher::{ChaChaCipher, CipherCapability, CHACHA20};
pub use exchange::{KeyExchange, KeyExchangeError, PublicKey};
pub use hmac_auth::{HmacAuth, HmacError};
pub use key::{KeyError, KeyMaterial, SessionKey};

use thiserror::Error;

/// Nonce size for ChaCha20-Poly1305 (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size for ChaCha20-Poly1305 (128 bits)
pub const AEAD_TAG_SIZE: usize = 16;

/// HMAC-SHA256 tag size (256 bits)
pub const HMAC_TAG_SIZE: usize = 32;

/// Minimum key size (256 bits)
pub const MIN_KEY_SIZE: usize = 32;

/// Size of freshly generated session keys
pub const SESSION_KEY_SIZE: usize = 32;

/// Unified error type for all cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// AEAD encryption/decryption error.
    #[error("AEAD: {0}")]
    Aead(#[from] AeadError),

    /// HMAC authentication error.
    #[error("HMAC: {0}")]
    Hmac(#[from] HmacError),

    /// Key material error.
    #[error("Key: {0}")]
    Key(#[from] KeyError),

    /// Key exchange error (X25519).
    #[error("Key exchange: {0}")]
    Exchange(#[from] KeyExchangeError),

    /// The cipher capability does not implement this method.
    #[error("Unsupported crypto method: {0}")]
    UnsupportedMethod(String),

    /// A feature was switched on but no key is available.
    #[error("No key available to enable {0}")]
    NoKey(&'static str),
}
