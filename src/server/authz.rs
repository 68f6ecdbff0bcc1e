//! Authorization policy.
//!
//! Rules are `identity/host` patterns per permission level, with `*` as a
//! wildcard on either side:
//!
//! | Pattern | Matches |
//! |---|---|
//! | `*` | anyone, authenticated or not |
//! | `alice@example.org` | that identity from any host |
//! | `*@example.org/10.0.0.*` | any identity of the domain from the subnet |
//! | `unauthenticated` | peers that did not authenticate |
//!
//! A rule for a stronger level also grants the levels it implies
//! (see [`Permission::implies`]).

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;

use crate::config::{Permission, SecurityConfig};

/// Keyword matching peers without an identity
pub const UNAUTHENTICATED: &str = "unauthenticated";

/// Decides whether an identity may use a permission level.
pub trait AuthorizationPolicy: Send + Sync + fmt::Debug {
    /// `identity` is `None` for unauthenticated peers; `peer` is the source
    /// address
    fn verify(&self, identity: Option<&str>, permission: Permission, peer: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    identity: String,
    host: String,
}

impl Rule {
    fn parse(pattern: &str) -> Self {
        let pattern = pattern.trim();
        match pattern.split_once('/') {
            Some((identity, host)) => Self {
                identity: identity.to_string(),
                host: host.to_string(),
            },
            None => Self {
                identity: pattern.to_string(),
                host: "*".to_string(),
            },
        }
    }

    fn matches(&self, identity: Option<&str>, host: &str) -> bool {
        let identity_ok = match identity {
            _ if self.identity == "*" => true,
            None => self.identity.eq_ignore_ascii_case(UNAUTHENTICATED),
            Some(name) => glob_match(&self.identity, name),
        };
        identity_ok && glob_match(&self.host, host)
    }
}

/// `*` matches any run of characters; matching is case-insensitive.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern = pattern.to_ascii_lowercase();
    let text = text.to_ascii_lowercase();
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let mut rest = text.as_str();
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

/// Host part of a peer address
fn host_of(peer: &str) -> &str {
    if peer.parse::<SocketAddr>().is_ok() {
        if let Some((host, _)) = peer.rsplit_once(':') {
            return host.trim_start_matches('[').trim_end_matches(']');
        }
    }
    peer
}

/// Pattern lists per permission level.
#[derive(Debug, Clone, Default)]
pub struct AllowList {
    rules: BTreeMap<Permission, Vec<Rule>>,
}

impl AllowList {
    /// Deny everything except ALLOW-level commands
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant every level to everyone
    pub fn permissive() -> Self {
        let mut list = Self::new();
        for permission in Permission::ALL {
            list.allow(permission, "*");
        }
        list
    }

    /// Build from the `[authorization]` table. An empty table opens READ
    /// to everyone and nothing else.
    pub fn from_config(config: &SecurityConfig) -> Self {
        let mut list = Self::new();
        if config.authorization.is_empty() {
            list.allow(Permission::Read, "*");
            return list;
        }
        for (permission, patterns) in &config.authorization {
            for pattern in patterns {
                list.allow(*permission, pattern);
            }
        }
        list
    }

    /// Add a pattern for `permission`
    pub fn allow(&mut self, permission: Permission, pattern: &str) -> &mut Self {
        self.rules
            .entry(permission)
            .or_default()
            .push(Rule::parse(pattern));
        self
    }
}

impl AuthorizationPolicy for AllowList {
    fn verify(&self, identity: Option<&str>, permission: Permission, peer: &str) -> bool {
        if permission == Permission::Allow {
            return true;
        }
        let host = host_of(peer);
        self.rules
            .iter()
            .filter(|(granted, _)| granted.implies(permission))
            .flat_map(|(_, rules)| rules)
            .any(|rule| rule.matches(identity, host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("*@example.org", "alice@EXAMPLE.org"));
        assert!(glob_match("10.0.0.*", "10.0.0.7"));
        assert!(glob_match("a*c*e", "abcde"));
        assert!(!glob_match("a*c*e", "abcd"));
        assert!(!glob_match("alice@*", "bob@example.org"));
        assert!(glob_match("exact", "EXACT"));
    }

    #[test]
    fn test_host_of() {
        assert_eq!(host_of("10.0.0.7:9618"), "10.0.0.7");
        assert_eq!(host_of("[::1]:9618"), "::1");
        assert_eq!(host_of("local"), "local");
    }

    #[test]
    fn test_identity_and_host_patterns() {
        let mut list = AllowList::new();
        list.allow(Permission::Write, "*@example.org/10.0.0.*");

        assert!(list.verify(Some("alice@example.org"), Permission::Write, "10.0.0.7:1"));
        assert!(!list.verify(Some("alice@example.org"), Permission::Write, "10.0.1.7:1"));
        assert!(!list.verify(Some("mallory@evil.org"), Permission::Write, "10.0.0.7:1"));
        assert!(!list.verify(None, Permission::Write, "10.0.0.7:1"));
    }

    #[test]
    fn test_stronger_level_implies_weaker() {
        let mut list = AllowList::new();
        list.allow(Permission::Administrator, "root@example.org");

        assert!(list.verify(Some("root@example.org"), Permission::Read, "h:1"));
        assert!(list.verify(Some("root@example.org"), Permission::Write, "h:1"));
        assert!(!list.verify(Some("root@example.org"), Permission::Daemon, "h:1"));
    }

    #[test]
    fn test_unauthenticated_keyword() {
        let mut list = AllowList::new();
        list.allow(Permission::Read, UNAUTHENTICATED);

        assert!(list.verify(None, Permission::Read, "h:1"));
        assert!(!list.verify(Some("alice"), Permission::Read, "h:1"));
    }

    #[test]
    fn test_allow_level_always_passes() {
        assert!(AllowList::new().verify(None, Permission::Allow, "h:1"));
        assert!(!AllowList::new().verify(None, Permission::Read, "h:1"));
    }

    #[test]
    fn test_from_config() {
        let empty = AllowList::from_config(&SecurityConfig::default());
        assert!(empty.verify(None, Permission::Read, "h:1"));
        assert!(!empty.verify(Some("alice"), Permission::Write, "h:1"));

        let mut config = SecurityConfig::default();
        config
            .authorization
            .insert(Permission::Daemon, vec!["condor@*".into()]);
        let list = AllowList::from_config(&config);
        assert!(list.verify(Some("condor@pool"), Permission::Write, "h:1"));
        assert!(!list.verify(None, Permission::Read, "h:1"));
    }
}
