//! Cached security sessions.

use std::time::{Duration, Instant};

use crate::crypto::SessionKey;
use crate::protocol::{attr, NegotiationRecord};

/// A cached session: key material plus the decided policy it was created
/// under.
///
/// An entry is live until its absolute expiration passes or, when it has a
/// lease, until it has gone unused for longer than the lease. Whichever
/// comes first ends it.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    id: String,
    bound_peer: Option<String>,
    keys: Vec<SessionKey>,
    policy: NegotiationRecord,
    expires_at: Option<Instant>,
    lease: Duration,
    last_touched: Instant,
    lingers: bool,
}

impl SessionEntry {
    /// New entry touched at `now`, with no keys, no expiration and no lease
    pub fn new(id: impl Into<String>, policy: NegotiationRecord, now: Instant) -> Self {
        Self {
            id: id.into(),
            bound_peer: None,
            keys: Vec::new(),
            policy,
            expires_at: None,
            lease: Duration::ZERO,
            last_touched: now,
            lingers: false,
        }
    }

    /// Bind to a peer address (`None` = usable by any peer)
    pub fn bound_to(mut self, peer: Option<String>) -> Self {
        self.bound_peer = peer;
        self
    }

    /// Attach key material
    pub fn with_keys(mut self, keys: Vec<SessionKey>) -> Self {
        self.keys = keys;
        self
    }

    /// Set an absolute expiration
    pub fn expiring_at(mut self, at: Option<Instant>) -> Self {
        self.expires_at = at;
        self
    }

    /// Set the idle lease (zero = no lease)
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Session id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Peer this session is bound to
    pub fn bound_peer(&self) -> Option<&str> {
        self.bound_peer.as_deref()
    }

    /// All keys, in crypto-method order
    pub fn keys(&self) -> &[SessionKey] {
        &self.keys
    }

    /// Key for `method`, if any
    pub fn key_for(&self, method: &str) -> Option<&SessionKey> {
        self.keys
            .iter()
            .find(|k| k.method().eq_ignore_ascii_case(method))
    }

    /// Preferred key (first)
    pub fn primary_key(&self) -> Option<&SessionKey> {
        self.keys.first()
    }

    /// Decided policy
    pub fn policy(&self) -> &NegotiationRecord {
        &self.policy
    }

    /// Mutable decided policy
    pub fn policy_mut(&mut self) -> &mut NegotiationRecord {
        &mut self.policy
    }

    /// Commands this session covers
    pub fn valid_commands(&self) -> Vec<String> {
        self.policy
            .get_list(attr::VALID_COMMANDS)
            .unwrap_or_default()
    }

    /// Absolute expiration
    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    /// Change the absolute expiration
    pub fn set_expires_at(&mut self, at: Option<Instant>) {
        self.expires_at = at;
    }

    /// Idle lease
    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Last time the lease was renewed
    pub fn last_touched(&self) -> Instant {
        self.last_touched
    }

    /// Renew the lease
    pub fn touch(&mut self, now: Instant) {
        self.last_touched = now;
    }

    /// Whether a colliding insert may replace this entry
    pub fn lingers(&self) -> bool {
        self.lingers
    }

    /// Mark the entry as replaceable
    pub fn set_lingers(&mut self, lingers: bool) {
        self.lingers = lingers;
    }

    /// Instant at which the lease runs out, if leased
    pub fn lease_expires_at(&self) -> Option<Instant> {
        (!self.lease.is_zero()).then(|| self.last_touched + self.lease)
    }

    /// Whether the entry is dead at `now`
    pub fn is_expired_at(&self, now: Instant) -> bool {
        let absolute = self.expires_at.is_some_and(|at| now >= at);
        let idle = self.lease_expires_at().is_some_and(|at| now >= at);
        absolute || idle
    }

    /// Time remaining before the entry dies, from `now`
    pub fn remaining_at(&self, now: Instant) -> Option<Duration> {
        [self.expires_at, self.lease_expires_at()]
            .into_iter()
            .flatten()
            .min()
            .map(|end| end.saturating_duration_since(now))
    }

    /// Owning-process id recorded by the peer
    pub fn owner_unique_id(&self) -> Option<&str> {
        self.policy.get_str(attr::OWNER_UNIQUE_ID)
    }

    /// Process id recorded by the peer
    pub fn server_pid(&self) -> Option<i64> {
        self.policy.get_int(attr::SERVER_PROCESS_ID)
    }
}
