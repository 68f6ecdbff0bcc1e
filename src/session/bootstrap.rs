//! Pending-bootstrap registry.
//!
//! A datagram command to a peer we hold no session with must first create
//! one over a reliable transport. When several tasks need the same session
//! at once, the first becomes the owner and runs the bootstrap; everyone
//! else waits and receives the owner's outcome, in the order they arrived.
//!
//! The map is guarded by a synchronous mutex that is never held across an
//! await point.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

/// Final result of one bootstrap attempt, shared with every waiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// The session now exists
    Established {
        /// New session id
        session_id: String,
    },
    /// The attempt failed; waiters should give up rather than retry
    Failed {
        /// Why
        reason: String,
    },
}

impl BootstrapOutcome {
    /// Whether the session was established
    pub fn is_established(&self) -> bool {
        matches!(self, BootstrapOutcome::Established { .. })
    }
}

type Waiters = Vec<oneshot::Sender<BootstrapOutcome>>;

/// In-flight bootstraps keyed by session key.
#[derive(Debug, Default)]
pub struct PendingBootstraps {
    inflight: Mutex<HashMap<String, Waiters>>,
}

/// What [`PendingBootstraps::begin`] handed out.
#[derive(Debug)]
pub enum BootstrapTicket {
    /// No bootstrap was running; the caller must run it
    Owner(BootstrapGuard),
    /// Another task is already bootstrapping this key
    Waiter(BootstrapWaiter),
}

impl PendingBootstraps {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Waiters>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim `key`, or queue behind whoever already holds it.
    pub fn begin(self: &Arc<Self>, key: &str) -> BootstrapTicket {
        let mut map = self.map();
        match map.get_mut(key) {
            Some(waiters) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                tracing::debug!(key, position = waiters.len(), "waiting on in-flight bootstrap");
                BootstrapTicket::Waiter(BootstrapWaiter {
                    key: key.to_string(),
                    position: waiters.len(),
                    rx,
                })
            }
            None => {
                map.insert(key.to_string(), Vec::new());
                tracing::debug!(key, "starting bootstrap");
                BootstrapTicket::Owner(BootstrapGuard {
                    registry: Arc::clone(self),
                    key: key.to_string(),
                    resolved: false,
                })
            }
        }
    }

    /// Whether a bootstrap for `key` is running
    pub fn is_pending(&self, key: &str) -> bool {
        self.map().contains_key(key)
    }

    /// Number of tasks queued behind the bootstrap for `key`
    pub fn waiter_count(&self, key: &str) -> usize {
        self.map().get(key).map_or(0, Vec::len)
    }

    /// Number of bootstraps running
    pub fn len(&self) -> usize {
        self.map().len()
    }

    /// Check if no bootstrap is running
    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    fn finish(&self, key: &str, outcome: &BootstrapOutcome) -> usize {
        let waiters = self.map().remove(key).unwrap_or_default();
        let count = waiters.len();
        for waiter in waiters {
            // a dropped receiver just means that waiter stopped caring
            let _ = waiter.send(outcome.clone());
        }
        count
    }
}

/// Held by the task running a bootstrap. Dropping it unresolved fails every
/// waiter.
#[derive(Debug)]
pub struct BootstrapGuard {
    registry: Arc<PendingBootstraps>,
    key: String,
    resolved: bool,
}

impl BootstrapGuard {
    /// Session key being bootstrapped
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Publish the outcome to every waiter and release the key. Returns how
    /// many waiters were notified.
    pub fn resolve(mut self, outcome: BootstrapOutcome) -> usize {
        self.resolved = true;
        let notified = self.registry.finish(&self.key, &outcome);
        tracing::debug!(
            key = %self.key,
            notified,
            established = outcome.is_established(),
            "bootstrap resolved"
        );
        notified
    }
}

impl Drop for BootstrapGuard {
    fn drop(&mut self) {
        if !self.resolved {
            let notified = self.registry.finish(
                &self.key,
                &BootstrapOutcome::Failed {
                    reason: "bootstrap abandoned".into(),
                },
            );
            tracing::warn!(key = %self.key, notified, "bootstrap dropped before resolving");
        }
    }
}

/// Held by a task queued behind another task's bootstrap.
#[derive(Debug)]
pub struct BootstrapWaiter {
    key: String,
    position: usize,
    rx: oneshot::Receiver<BootstrapOutcome>,
}

impl BootstrapWaiter {
    /// Session key being waited on
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Place in the queue, starting at 1; waiters are notified in this order
    pub fn position(&self) -> usize {
        self.position
    }

    /// Suspend until the owner resolves
    pub async fn wait(self) -> BootstrapOutcome {
        self.rx.await.unwrap_or_else(|_| BootstrapOutcome::Failed {
            reason: "bootstrap owner went away".into(),
        })
    }
}
