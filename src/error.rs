//! Security negotiation error types.
//!
//! Failures are classified by where the negotiation broke down:
//!
//! - **Config**: the local policy cannot be satisfied (a required feature
//!   with no configured method, a REQUIRED/NEVER conflict between our own
//!   permission classes). Detected before the peer is contacted.
//! - **Protocol**: the peer sent something we cannot use (missing attribute,
//!   malformed record, premature disconnect).
//! - **PolicyConflict**: the peer could not reconcile our declared policy.
//! - **AuthenticationFailed** / **AuthorizationDenied**: the peer was reached
//!   and answered, but said no.
//! - **SessionNotFound**: a session id referenced by either side is unknown.
//! - **Transport** / **Timeout**: connect, read or write failed or the
//!   operation deadline expired.
//!
//! Every negotiation failure is also pushed onto an [`ErrorStack`] so callers
//! can inspect the chain of subsystems involved before deciding to retry.

use std::fmt;

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::protocol::ReturnCode;

/// Security negotiation errors.
#[derive(Error, Debug)]
pub enum SecManError {
    /// Local configuration or policy is irreconcilable.
    #[error("Config error: {0}")]
    Config(String),

    /// Protocol-level error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer rejected our declared policy.
    #[error("Policy conflict: {0}")]
    PolicyConflict(String),

    /// Authentication was required and did not succeed.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The peer denied the command.
    #[error("Authorization denied ({code}): {message}")]
    AuthorizationDenied {
        /// Outcome code reported by the acceptor.
        code: ReturnCode,
        /// Human readable detail.
        message: String,
    },

    /// A referenced session id is unknown.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Network communication error.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The per-operation deadline expired.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Cryptographic operation failed.
    #[error("Crypto error: {0}")]
    Crypto(#[source] CryptoError),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for negotiation operations
pub type Result<T> = std::result::Result<T, SecManError>;

impl SecManError {
    /// Stable code naming the failure class.
    pub fn code(&self) -> &'static str {
        match self {
            SecManError::Config(_) => "CONFIGURATION",
            SecManError::Protocol(_) | SecManError::Json(_) => "PROTOCOL",
            SecManError::PolicyConflict(_) => "POLICY_CONFLICT",
            SecManError::AuthenticationFailed(_) => "AUTHENTICATION_FAILURE",
            SecManError::AuthorizationDenied { .. } => "AUTHORIZATION_DENIED",
            SecManError::SessionNotFound(_) => "SESSION_NOT_FOUND",
            SecManError::Transport(_) | SecManError::Io(_) => "TRANSPORT_FAILURE",
            SecManError::Timeout(_) => "TIMEOUT",
            SecManError::Crypto(_) => "CRYPTO",
        }
    }

    /// Whether a fresh attempt (new connection or new bootstrap) may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SecManError::SessionNotFound(_)
                | SecManError::Transport(_)
                | SecManError::Timeout(_)
                | SecManError::Io(_)
        )
    }
}

impl From<CryptoError> for SecManError {
    fn from(err: CryptoError) -> Self {
        SecManError::Crypto(err)
    }
}

impl From<toml::de::Error> for SecManError {
    fn from(err: toml::de::Error) -> Self {
        SecManError::Config(err.to_string())
    }
}

impl From<base64::DecodeError> for SecManError {
    fn from(err: base64::DecodeError) -> Self {
        SecManError::Protocol(format!("Base64 decode error: {err}"))
    }
}

/// One entry of an [`ErrorStack`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFrame {
    /// Subsystem that reported the failure (e.g. `SECMAN`, `AUTHENTICATE`).
    pub subsystem: String,
    /// Failure class code.
    pub code: String,
    /// Detail message.
    pub message: String,
}

impl fmt::Display for ErrorFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.subsystem, self.code, self.message)
    }
}

/// Ordered accumulator of failures observed during one operation.
///
/// Frames are pushed innermost-first; [`ErrorStack::last`] is the most
/// recent (outermost) failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorStack {
    frames: Vec<ErrorFrame>,
}

impl ErrorStack {
    /// Create an empty stack
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a frame
    pub fn push(
        &mut self,
        subsystem: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.frames.push(ErrorFrame {
            subsystem: subsystem.into(),
            code: code.into(),
            message: message.into(),
        });
    }

    /// Push a frame describing `err`
    pub fn push_error(&mut self, subsystem: impl Into<String>, err: &SecManError) {
        self.push(subsystem, err.code(), err.to_string());
    }

    /// All frames, oldest first
    pub fn frames(&self) -> &[ErrorFrame] {
        &self.frames
    }

    /// Most recent frame
    pub fn last(&self) -> Option<&ErrorFrame> {
        self.frames.last()
    }

    /// Whether any frame carries `code`
    pub fn has_code(&self, code: &str) -> bool {
        self.frames.iter().any(|f| f.code == code)
    }

    /// Check if the stack is empty
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Number of frames
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Drop all frames
    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

impl fmt::Display for ErrorStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, frame) in self.frames.iter().rev().enumerate() {
            if i > 0 {
                f.write_str("|")?;
            }
            write!(f, "{frame}")?;
        }
        Ok(())
    }
}
