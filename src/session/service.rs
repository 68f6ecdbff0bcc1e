//! Shared session service.
//!
//! Owns the session store and command index behind one async `RwLock`, so a
//! lookup followed by use of what was found cannot race an eviction of the
//! same entry, and the pending-bootstrap registry that coalesces concurrent
//! datagram bootstraps.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use super::bootstrap::PendingBootstraps;
use super::entry::SessionEntry;
use super::export::{export_session_info, import_session_info};
use super::index::CommandSessionIndex;
use super::store::{SessionStore, StoreError};
use crate::config::{Permission, PolicyRequest, SecurityConfig};
use crate::crypto::{CipherCapability, SessionKey};
use crate::error::{Result, SecManError};
use crate::protocol::{attr, reconcile, NegotiationRecord, RequirementLevel};

/// Store and index, locked together.
#[derive(Debug, Default)]
struct SessionCache {
    store: SessionStore,
    index: CommandSessionIndex,
}

/// Key material and decided policy copied out of a live session.
#[derive(Debug, Clone)]
pub struct CachedSession {
    /// Session id
    pub id: String,
    /// Peer the session is bound to
    pub bound_peer: Option<String>,
    /// Keys in crypto-method order
    pub keys: Vec<SessionKey>,
    /// Decided policy
    pub policy: NegotiationRecord,
}

impl CachedSession {
    fn from_entry(entry: &SessionEntry) -> Self {
        Self {
            id: entry.id().to_string(),
            bound_peer: entry.bound_peer().map(String::from),
            keys: entry.keys().to_vec(),
            policy: entry.policy().clone(),
        }
    }

    /// Key for the first crypto method in the decided policy, falling back
    /// to the first key held
    pub fn preferred_key(&self) -> Option<&SessionKey> {
        self.policy
            .get_list(attr::CRYPTO_METHODS)
            .and_then(|methods| {
                methods.into_iter().find_map(|m| {
                    self.keys
                        .iter()
                        .find(|k| k.method().eq_ignore_ascii_case(&m))
                })
            })
            .or_else(|| self.keys.first())
    }
}

/// JSON view of one session for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    /// Session id
    pub id: String,
    /// Bound peer
    pub peer: Option<String>,
    /// Authenticated identity, if known
    pub user: Option<String>,
    /// Crypto methods with keys
    pub crypto_methods: Vec<String>,
    /// Commands the session covers
    pub valid_commands: Vec<String>,
    /// When the session dies (earliest of expiry and lease)
    pub expires_at: Option<DateTime<Utc>>,
    /// Idle lease in seconds
    pub lease_secs: u64,
    /// Seconds since last use
    pub idle_secs: u64,
    /// Replaceable by a colliding insert
    pub lingers: bool,
}

impl SessionSummary {
    fn from_entry(entry: &SessionEntry, now: Instant, wall: DateTime<Utc>) -> Self {
        Self {
            id: entry.id().to_string(),
            peer: entry.bound_peer().map(String::from),
            user: entry.policy().get_str(attr::USER).map(String::from),
            crypto_methods: entry.keys().iter().map(|k| k.method().to_string()).collect(),
            valid_commands: entry.valid_commands(),
            expires_at: entry.remaining_at(now).and_then(|left| {
                chrono::Duration::from_std(left).ok().map(|left| wall + left)
            }),
            lease_secs: entry.lease().as_secs(),
            idle_secs: now.saturating_duration_since(entry.last_touched()).as_secs(),
            lingers: entry.lingers(),
        }
    }
}

/// Parameters for a session agreed out of band.
#[derive(Debug, Clone, Default)]
pub struct NonNegotiatedSession {
    /// Session id both sides will use
    pub id: String,
    /// Permission level whose policy applies
    pub permission: Option<Permission>,
    /// Shared secret every key is derived from
    pub secret: Vec<u8>,
    /// Exported session info from the creating side
    pub exported_info: Option<String>,
    /// Authentication method to record
    pub auth_method: Option<String>,
    /// Identity of the peer, if already known
    pub peer_identity: Option<String>,
    /// Address of the peer; commands are indexed for it
    pub peer_address: Option<String>,
    /// Lifetime when the exported info carries no expiration
    pub duration: Option<Duration>,
    /// Extra attributes to seed the policy with
    pub policy: Option<NegotiationRecord>,
}

/// Process-wide session cache and bootstrap registry.
#[derive(Debug, Default)]
pub struct SessionService {
    cache: RwLock<SessionCache>,
    bootstraps: Arc<PendingBootstraps>,
}

impl SessionService {
    /// Create an empty service
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry of in-flight bootstraps
    pub fn bootstraps(&self) -> &Arc<PendingBootstraps> {
        &self.bootstraps
    }

    /// Find a reusable session for `(peer, command)`, trying `hint` first.
    /// Renews the lease of whatever is found; prunes stale index rows.
    pub async fn resume(&self, peer: &str, command: u32, hint: Option<&str>) -> Option<CachedSession> {
        let now = Instant::now();
        let mut cache = self.cache.write().await;

        if let Some(id) = hint {
            if let Some(entry) = cache.store.lookup_at(id, now) {
                entry.touch(now);
                return Some(CachedSession::from_entry(entry));
            }
        }

        let id = cache.index.get(peer, command)?.to_string();
        match cache.store.lookup_at(&id, now) {
            Some(entry) => {
                entry.touch(now);
                Some(CachedSession::from_entry(entry))
            }
            None => {
                tracing::debug!(session_id = %id, peer, command, "pruning stale index entry");
                cache.index.remove(peer, command);
                None
            }
        }
    }

    /// Live session by id, renewing its lease
    pub async fn resume_by_id(&self, id: &str) -> Option<CachedSession> {
        let now = Instant::now();
        let mut cache = self.cache.write().await;
        cache.store.lookup_at(id, now).map(|entry| {
            entry.touch(now);
            CachedSession::from_entry(entry)
        })
    }

    /// Whether `id` names a live session
    pub async fn contains(&self, id: &str) -> bool {
        self.cache.write().await.store.lookup(id).is_some()
    }

    /// Insert a new session. A lingering or dead entry under the same id is
    /// replaced. When `index_peer` is given, every valid command is indexed
    /// for that peer.
    pub async fn insert(&self, entry: SessionEntry, index_peer: Option<&str>) -> Result<()> {
        let now = Instant::now();
        let commands = entry.valid_commands();
        let id = entry.id().to_string();

        let mut cache = self.cache.write().await;
        if cache
            .store
            .peek(&id)
            .is_some_and(|old| old.is_expired_at(now))
        {
            tracing::debug!(session_id = %id, "replacing dead session");
            cache.store.invalidate(&id);
            cache.index.remove_session(&id);
        }
        match cache.store.insert_at(entry.clone(), now) {
            Ok(()) => {}
            Err(StoreError::Collision { lingering: true, .. }) => {
                tracing::info!(session_id = %id, "replacing lingering session");
                cache.store.invalidate(&id);
                cache.index.remove_session(&id);
                cache
                    .store
                    .insert_at(entry, now)
                    .map_err(|e| SecManError::Config(e.to_string()))?;
            }
            Err(e) => return Err(SecManError::Config(e.to_string())),
        }

        if let Some(peer) = index_peer {
            cache.index.insert_commands(peer, &commands, &id);
        }
        Ok(())
    }

    /// Remove one session and the index rows it created
    pub async fn invalidate_key(&self, id: &str) -> bool {
        let mut cache = self.cache.write().await;
        match cache.store.invalidate(id) {
            Some(entry) => {
                if let Some(peer) = entry.bound_peer() {
                    cache.index.remove_commands(peer, &entry.valid_commands(), id);
                }
                tracing::debug!(session_id = id, "invalidated session");
                true
            }
            None => false,
        }
    }

    /// Remove every session bound to `peer`
    pub async fn invalidate_host(&self, peer: &str) -> usize {
        let mut cache = self.cache.write().await;
        let removed = cache.store.invalidate_by_peer(peer);
        for entry in &removed {
            cache.index.remove_session(entry.id());
        }
        if !removed.is_empty() {
            tracing::debug!(peer, count = removed.len(), "invalidated sessions for peer");
        }
        removed.len()
    }

    /// Remove every session created by the process `(owner_id, pid)`
    pub async fn invalidate_by_owner(&self, owner_id: &str, pid: i64) -> usize {
        let mut cache = self.cache.write().await;
        let removed = cache.store.invalidate_by_owner(owner_id, pid);
        for entry in &removed {
            cache.index.remove_session(entry.id());
        }
        removed.len()
    }

    /// Remove everything
    pub async fn invalidate_all(&self) -> usize {
        let mut cache = self.cache.write().await;
        cache.index.clear();
        cache.store.clear().len()
    }

    /// Evict dead sessions and the index rows pointing at them. Returns the
    /// removed ids.
    pub async fn sweep_expired(&self) -> Vec<String> {
        self.sweep_expired_at(Instant::now()).await
    }

    /// [`SessionService::sweep_expired`] at a given instant
    pub async fn sweep_expired_at(&self, now: Instant) -> Vec<String> {
        let mut cache = self.cache.write().await;
        let ids: Vec<String> = cache
            .store
            .sweep_expired_at(now)
            .iter()
            .map(|entry| entry.id().to_string())
            .collect();
        for id in &ids {
            cache.index.remove_session(id);
        }
        if !ids.is_empty() {
            tracing::debug!(count = ids.len(), "swept expired sessions");
        }
        ids
    }

    /// Handle a session-not-found notice from a peer
    pub async fn handle_invalidate_notice(&self, notice: &NegotiationRecord) -> bool {
        match notice.get_str(attr::SESSION_ID) {
            Some(id) => {
                tracing::info!(session_id = id, "peer reported unknown session");
                self.invalidate_key(id).await
            }
            None => false,
        }
    }

    /// Change a session's absolute expiration
    pub async fn set_session_expiration(&self, id: &str, at: Option<Instant>) -> Result<()> {
        let mut cache = self.cache.write().await;
        let entry = cache
            .store
            .lookup(id)
            .ok_or_else(|| SecManError::SessionNotFound(id.to_string()))?;
        entry.set_expires_at(at);
        Ok(())
    }

    /// Mark a session as replaceable by a colliding insert
    pub async fn set_linger_flag(&self, id: &str) -> Result<()> {
        let mut cache = self.cache.write().await;
        let entry = cache
            .store
            .lookup(id)
            .ok_or_else(|| SecManError::SessionNotFound(id.to_string()))?;
        entry.set_lingers(true);
        Ok(())
    }

    /// Decided policy of a live session
    pub async fn session_policy(&self, id: &str) -> Option<NegotiationRecord> {
        self.cache
            .write()
            .await
            .store
            .lookup(id)
            .map(|entry| entry.policy().clone())
    }

    /// One string attribute from a live session's policy
    pub async fn session_attribute(&self, id: &str, name: &str) -> Option<String> {
        self.cache
            .write()
            .await
            .store
            .lookup(id)
            .and_then(|entry| entry.policy().get_str(name).map(String::from))
    }

    /// Exported session info for a live session
    pub async fn export_session_info(&self, id: &str) -> Result<String> {
        let policy = self
            .session_policy(id)
            .await
            .ok_or_else(|| SecManError::SessionNotFound(id.to_string()))?;
        export_session_info(&policy)
    }

    /// Admin view of every session
    pub async fn summaries(&self) -> Vec<SessionSummary> {
        let (now, wall) = (Instant::now(), Utc::now());
        let cache = self.cache.read().await;
        let mut out: Vec<SessionSummary> = cache
            .store
            .iter()
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| SessionSummary::from_entry(entry, now, wall))
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Admin view of one session
    pub async fn summary(&self, id: &str) -> Option<SessionSummary> {
        let (now, wall) = (Instant::now(), Utc::now());
        let cache = self.cache.read().await;
        cache
            .store
            .peek(id)
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| SessionSummary::from_entry(entry, now, wall))
    }

    /// Number of cached sessions (live or not yet swept)
    pub async fn len(&self) -> usize {
        self.cache.read().await.store.len()
    }

    /// Check if no sessions are cached
    pub async fn is_empty(&self) -> bool {
        self.cache.read().await.store.is_empty()
    }

    /// Create a session both sides agreed on out of band, without any
    /// negotiation round trip.
    pub async fn create_non_negotiated_session(
        &self,
        config: &SecurityConfig,
        cipher: &dyn CipherCapability,
        params: NonNegotiatedSession,
    ) -> Result<()> {
        let permission = params.permission.unwrap_or(Permission::Daemon);
        let mut policy = params.policy.unwrap_or_default();

        let mut declared = config.declared_policy(permission, PolicyRequest::default(), cipher)?;
        // a session without negotiation would be useless
        declared.negotiation = RequirementLevel::Required;
        for (name, value) in declared.to_record().iter() {
            policy.set(name, value.clone());
        }

        let decided = reconcile(&declared, &declared).map_err(|e| {
            SecManError::Config(format!(
                "cannot create non-negotiated session {}: {e}",
                params.id
            ))
        })?;
        let decided = decided.to_record();
        for name in [
            attr::AUTHENTICATION,
            attr::INTEGRITY,
            attr::ENCRYPTION,
            attr::CRYPTO_METHODS,
        ] {
            policy.copy_from(&decided, name);
        }

        if let Some(info) = params.exported_info.as_deref() {
            import_session_info(info, &mut policy)?;
        }

        let crypto_methods = policy.get_list(attr::CRYPTO_METHODS).unwrap_or_default();
        policy.set_list(attr::CRYPTO_METHODS_LIST, &crypto_methods);
        policy.set(attr::USE_SESSION, "YES");
        policy.set(attr::SESSION_ID, params.id.as_str());
        policy.set(attr::ENACT, "YES");

        if let Some(method) = &params.auth_method {
            policy.set(attr::AUTHENTICATION_METHODS, method.as_str());
        }
        if let Some(identity) = &params.peer_identity {
            policy.set(attr::AUTHENTICATION, "NO");
            policy.set(attr::TRIED_AUTHENTICATION, true);
            policy.set(attr::USER, identity.as_str());
        }

        let now = Instant::now();
        let now_unix = Utc::now().timestamp();
        let expires_at = match policy.get_int(attr::SESSION_EXPIRES) {
            Some(0) => None,
            Some(unix) => {
                let left = unix - now_unix;
                if left < 0 {
                    return Err(SecManError::Config(format!(
                        "non-negotiated session {} already expired",
                        params.id
                    )));
                }
                Some(now + Duration::from_secs(left as u64))
            }
            None => match params.duration.filter(|d| !d.is_zero()) {
                Some(duration) => {
                    policy.set(
                        attr::SESSION_EXPIRES,
                        now_unix + duration.as_secs() as i64,
                    );
                    Some(now + duration)
                }
                None => None,
            },
        };

        let mut keys = Vec::new();
        for method in &crypto_methods {
            if !cipher.supports(method) {
                tracing::warn!(method = %method, session_id = %params.id, "no key for unsupported crypto method");
                continue;
            }
            keys.push(cipher.key_from_secret(method, &params.secret)?);
        }

        let entry = SessionEntry::new(params.id.clone(), policy, now)
            .bound_to(params.peer_address.clone())
            .with_keys(keys)
            .expiring_at(expires_at);

        self.insert(entry, params.peer_address.as_deref()).await?;
        tracing::info!(
            session_id = %params.id,
            peer = ?params.peer_address,
            expires_in = ?expires_at.map(|at| at.saturating_duration_since(now)),
            "created non-negotiated session"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{ChaChaCipher, CHACHA20};

    fn entry(id: &str, peer: Option<&str>, commands: &str) -> SessionEntry {
        let mut policy = NegotiationRecord::new();
        policy.set(attr::VALID_COMMANDS, commands);
        policy.set(attr::CRYPTO_METHODS, CHACHA20);
        SessionEntry::new(id, policy, Instant::now()).bound_to(peer.map(String::from))
    }

    #[tokio::test]
    async fn test_resume_via_index_and_hint() {
        let service = SessionService::new();
        service
            .insert(entry("s1", Some("peer:1"), "421,422"), Some("peer:1"))
            .await
            .unwrap();

        assert_eq!(service.resume("peer:1", 421, None).await.unwrap().id, "s1");
        assert!(service.resume("peer:1", 999, None).await.is_none());
        assert_eq!(
            service.resume("peer:1", 999, Some("s1")).await.unwrap().id,
            "s1"
        );
        assert!(service.resume("peer:2", 421, None).await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_key_clears_index() {
        let service = SessionService::new();
        service
            .insert(entry("s1", Some("peer:1"), "421"), Some("peer:1"))
            .await
            .unwrap();

        assert!(service.invalidate_key("s1").await);
        assert!(!service.invalidate_key("s1").await);
        assert!(service.resume("peer:1", 421, None).await.is_none());
    }

    #[tokio::test]
    async fn test_lingering_collision_replaced() {
        let service = SessionService::new();
        service.insert(entry("s1", None, "1"), None).await.unwrap();
        assert!(service.insert(entry("s1", None, "2"), None).await.is_err());

        service.set_linger_flag("s1").await.unwrap();
        service.insert(entry("s1", None, "2"), None).await.unwrap();
        assert_eq!(
            service.session_attribute("s1", attr::VALID_COMMANDS).await.as_deref(),
            Some("2")
        );
    }

    #[tokio::test]
    async fn test_dead_entry_replaced_with_its_index_rows() {
        let service = SessionService::new();
        service
            .insert(
                entry("s1", Some("peer:1"), "421,422").expiring_at(Some(Instant::now())),
                Some("peer:1"),
            )
            .await
            .unwrap();

        // same id again, now covering 421 only
        service
            .insert(entry("s1", Some("peer:1"), "421"), Some("peer:1"))
            .await
            .unwrap();
        assert_eq!(service.resume("peer:1", 421, None).await.unwrap().id, "s1");
        assert!(service.resume("peer:1", 422, None).await.is_none());
    }

    #[tokio::test]
    async fn test_sweep_prunes_index() {
        let service = SessionService::new();
        let now = Instant::now();
        service
            .insert(
                entry("old", Some("peer:1"), "421").expiring_at(Some(now + Duration::from_secs(1))),
                Some("peer:1"),
            )
            .await
            .unwrap();
        service.insert(entry("live", None, "1"), None).await.unwrap();

        let swept = service.sweep_expired_at(now + Duration::from_secs(2)).await;
        assert_eq!(swept, vec!["old".to_string()]);
        assert_eq!(service.len().await, 1);
        assert!(service.resume("peer:1", 421, None).await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_notice() {
        let service = SessionService::new();
        service.insert(entry("s9", None, "1"), None).await.unwrap();

        let mut notice = NegotiationRecord::new();
        notice.set(attr::SESSION_ID, "s9");
        assert!(service.handle_invalidate_notice(&notice).await);
        assert!(service.is_empty().await);
    }

    #[tokio::test]
    async fn test_non_negotiated_session_shared_between_peers() {
        let config = SecurityConfig::default();
        let cipher = ChaChaCipher::new();

        let parent = SessionService::new();
        parent
            .create_non_negotiated_session(
                &config,
                &cipher,
                NonNegotiatedSession {
                    id: "claim#1".into(),
                    secret: b"shared-secret".to_vec(),
                    peer_address: Some("10.0.0.9:9618".into()),
                    duration: Some(Duration::from_secs(300)),
                    policy: Some({
                        let mut p = NegotiationRecord::new();
                        p.set(attr::VALID_COMMANDS, "60008,421");
                        p
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let exported = parent.export_session_info("claim#1").await.unwrap();
        assert!(exported.contains("SessionExpires="));

        let child = SessionService::new();
        child
            .create_non_negotiated_session(
                &config,
                &cipher,
                NonNegotiatedSession {
                    id: "claim#1".into(),
                    secret: b"shared-secret".to_vec(),
                    exported_info: Some(exported),
                    peer_identity: Some("condor@parent".into()),
                    peer_address: Some("10.0.0.1:9618".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let a = parent.resume("10.0.0.9:9618", 421, None).await.unwrap();
        let b = child.resume("10.0.0.1:9618", 60008, None).await.unwrap();
        assert_eq!(a.keys, b.keys);
        assert_eq!(b.policy.get_str(attr::USER), Some("condor@parent"));
        assert_eq!(b.policy.get_str(attr::AUTHENTICATION), Some("NO"));
        assert_eq!(b.policy.get_str(attr::USE_SESSION), Some("YES"));
        assert_eq!(b.policy.get_str(attr::ENACT), Some("YES"));
    }

    #[tokio::test]
    async fn test_non_negotiated_session_rejects_past_expiry() {
        let mut policy = NegotiationRecord::new();
        policy.set(attr::SESSION_EXPIRES, 1i64);
        let err = SessionService::new()
            .create_non_negotiated_session(
                &SecurityConfig::default(),
                &ChaChaCipher::new(),
                NonNegotiatedSession {
                    id: "x".into(),
                    secret: b"s".to_vec(),
                    policy: Some(policy),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SecManError::Config(_)));
    }

    #[tokio::test]
    async fn test_summaries() {
        let service = SessionService::new();
        service
            .insert(
                entry("b", Some("p"), "1").with_lease(Duration::from_secs(30)),
                None,
            )
            .await
            .unwrap();
        service.insert(entry("a", None, "1"), None).await.unwrap();

        let all = service.summaries().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, "a");
        assert!(all[0].expires_at.is_none());
        assert_eq!(all[1].lease_secs, 30);
        assert!(all[1].expires_at.is_some());
        assert!(service.summary("missing").await.is_none());
    }
}
