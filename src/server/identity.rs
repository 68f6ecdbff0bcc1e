//! "Is this destination myself?"
//!
//! A process that sends a datagram command to its own command socket skips
//! negotiation entirely and proves it is the same process with a random
//! cookie that never leaves the host.

use std::fmt;
use std::sync::{PoisonError, RwLock};

use base64::Engine;
use rand::RngCore;

/// Identity recorded for commands proven to come from this process
pub const LOCAL_IDENTITY: &str = "self@local";

/// Same-process detection and proof.
pub trait SelfIdentity: Send + Sync + fmt::Debug {
    /// Whether `addr` is one of our own command sockets
    fn is_self(&self, addr: &str) -> bool;

    /// Cookie to attach to commands sent to ourselves
    fn cookie(&self) -> &str;

    /// Whether `cookie` was issued by this process
    fn verify_cookie(&self, cookie: &str) -> bool;

    /// Unique id of this process, recorded in sessions it creates
    fn owner_id(&self) -> &str;

    /// Process id recorded alongside [`SelfIdentity::owner_id`]
    fn pid(&self) -> i64 {
        i64::from(std::process::id())
    }
}

/// Default [`SelfIdentity`]: a random owner id and cookie, plus the
/// addresses the daemon registered after binding.
#[derive(Default)]
pub struct ProcessIdentity {
    owner_id: String,
    cookie: String,
    addresses: RwLock<Vec<String>>,
}

impl fmt::Debug for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessIdentity")
            .field("owner_id", &self.owner_id)
            .field("addresses", &self.addresses())
            .finish_non_exhaustive()
    }
}

impl ProcessIdentity {
    /// Fresh identity with no registered addresses
    pub fn new() -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self {
            owner_id: uuid::Uuid::new_v4().to_string(),
            cookie: base64::engine::general_purpose::STANDARD.encode(secret),
            addresses: RwLock::new(Vec::new()),
        }
    }

    /// Register a bound command socket address
    pub fn register_address(&self, addr: impl Into<String>) {
        let addr = addr.into();
        let mut addresses = self.addresses.write().unwrap_or_else(PoisonError::into_inner);
        if !addresses.contains(&addr) {
            tracing::debug!(%addr, "registered local command address");
            addresses.push(addr);
        }
    }

    /// Registered addresses
    pub fn addresses(&self) -> Vec<String> {
        self.addresses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl SelfIdentity for ProcessIdentity {
    fn is_self(&self, addr: &str) -> bool {
        self.addresses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|a| a == addr)
    }

    fn cookie(&self) -> &str {
        &self.cookie
    }

    fn verify_cookie(&self, cookie: &str) -> bool {
        !cookie.is_empty() && cookie == self.cookie
    }

    fn owner_id(&self) -> &str {
        &self.owner_id
    }
}
