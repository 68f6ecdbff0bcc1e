//! # SecMan - Security Negotiation and Session Cache
//!
//! Negotiates how two daemons secure a command (authentication, encryption,
//! integrity), runs the authentication handshake, and caches the resulting
//! security session so later commands to the same peer skip all of it.
//!
//! ## Features
//!
//! - **Policy reconciliation**: four-level requirement matrix
//!   (REQUIRED / PREFERRED / OPTIONAL / NEVER) per feature
//! - **Pluggable authentication**: step-wise handshakes behind one trait
//! - **Session cache**: lookup by id or `(peer, command)`, absolute expiry plus
//!   idle lease, lingering replacement
//! - **Datagram commands**: protected by a cached session, bootstrapped over a
//!   stream once and shared by every concurrent sender
//!
//! ## Protocol Overview
//!
//! ```text
//! Initiator                                   Acceptor
//!    │── DC_AUTHENTICATE + declared policy ───► │
//!    │◄─────────────────────── decided policy ──│  reconcile
//!    │◄════════════ authentication ════════════►│
//!    │              crypto switched on          │
//!    │◄────────────────────────── session info ─│  cache
//!    │══════════════ command payload ══════════►│  dispatch
//! ```
//!
//! A second command to the same peer sends a short `UseSession` record and
//! goes straight to the payload.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use secman::{CommandInitiator, CommandRequest, ErrorStack, SecurityConfig, SessionService};
//!
//! let config = Arc::new(SecurityConfig::load(None)?);
//! let initiator = CommandInitiator::new(config, Arc::new(SessionService::new()));
//!
//! let mut errors = ErrorStack::new();
//! let (mut channel, outcome) = initiator
//!     .connect(&CommandRequest::new("10.0.0.5:9618", 421), &mut errors)
//!     .await?;
//! channel.send(&WireMessage::data(b"payload")).await?;
//! ```

pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use auth::{AuthRegistry, Authenticator, ClaimToBe};
pub use config::{Permission, SecurityConfig};
pub use crypto::{ChaChaCipher, CipherCapability, SessionKey};
pub use error::{ErrorStack, Result, SecManError};
pub use protocol::{
    reconcile, AcceptOutcome, CommandAcceptor, CommandInitiator, CommandOutcome, CommandRequest,
    DecidedPolicy, NegotiationRecord, RequirementLevel, SecurityPolicy, DC_AUTHENTICATE,
    DC_INVALIDATE_KEY, DC_SEC_QUERY, PROTOCOL_VERSION,
};
pub use server::{CommandTable, Daemon};
pub use session::{SessionEntry, SessionService};
pub use transport::{ReliableChannel, WireMessage};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
