//! Negotiation records exchanged between peers.
//!
//! A record is an ordered, case-insensitively keyed set of attributes. It
//! carries a declared policy, a decided policy, or post-authentication
//! session information. On the wire it is a JSON object whose key order is
//! the insertion order.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::policy::{FeatureDecision, RequirementLevel};
use crate::error::{Result, SecManError};

/// Attribute names understood by the negotiation engine.
pub mod attr {
    /// Declared level or decided action for negotiation
    pub const NEGOTIATION: &str = "Negotiation";
    /// Declared level or decided action for authentication
    pub const AUTHENTICATION: &str = "Authentication";
    /// Declared level or decided action for encryption
    pub const ENCRYPTION: &str = "Encryption";
    /// Declared level or decided action for integrity
    pub const INTEGRITY: &str = "Integrity";
    /// Single (first) authentication method
    pub const AUTHENTICATION_METHODS: &str = "AuthenticationMethods";
    /// Full reconciled authentication method list
    pub const AUTHENTICATION_METHODS_LIST: &str = "AuthenticationMethodsList";
    /// Crypto methods (comma separated)
    pub const CRYPTO_METHODS: &str = "CryptoMethods";
    /// Full reconciled crypto method list
    pub const CRYPTO_METHODS_LIST: &str = "CryptoMethodsList";
    /// Session duration in seconds, carried as a string
    pub const SESSION_DURATION: &str = "SessionDuration";
    /// Session lease in seconds
    pub const SESSION_LEASE: &str = "SessionLease";
    /// Absolute session expiration (unix seconds)
    pub const SESSION_EXPIRES: &str = "SessionExpires";
    /// Request creation of a new session
    pub const NEW_SESSION: &str = "NewSession";
    /// Request resumption of an existing session
    pub const USE_SESSION: &str = "UseSession";
    /// Session identifier
    pub const SESSION_ID: &str = "SessionId";
    /// Commands usable with a session
    pub const VALID_COMMANDS: &str = "ValidCommands";
    /// Whether the decision is already final (no reply expected)
    pub const ENACT: &str = "Enact";
    /// Same-process proof token
    pub const COOKIE: &str = "Cookie";
    /// Protocol version of the sender
    pub const REMOTE_VERSION: &str = "RemoteVersion";
    /// Short version used in exported session info
    pub const SHORT_VERSION: &str = "ShortVersion";
    /// Authenticated identity of the peer
    pub const USER: &str = "User";
    /// Identity as seen by the peer
    pub const MY_REMOTE_USER_NAME: &str = "MyRemoteUserName";
    /// Name produced by the authenticator
    pub const AUTHENTICATED_NAME: &str = "AuthenticatedName";
    /// Whether an authentication attempt was made
    pub const TRIED_AUTHENTICATION: &str = "TriedAuthentication";
    /// Where the sender accepts commands (used for notices)
    pub const SERVER_RETURN_ADDRESS: &str = "ServerReturnAddress";
    /// Address the initiator dialed
    pub const CONNECT_ADDRESS: &str = "ConnectAddress";
    /// Unique id of the sender's owning process
    pub const OWNER_UNIQUE_ID: &str = "OwnerUniqueId";
    /// Sender's process id
    pub const SERVER_PROCESS_ID: &str = "ServerProcessId";
    /// Whether failure to authenticate is fatal
    pub const AUTH_REQUIRED: &str = "AuthRequired";
    /// Outcome code
    pub const RETURN_CODE: &str = "ReturnCode";
    /// Command being requested
    pub const COMMAND: &str = "Command";
    /// Command whose permission governs an establish-session request
    pub const AUTH_COMMAND: &str = "AuthCommand";
    /// Reply to a decision-only probe
    pub const AUTHORIZATION_SUCCEEDED: &str = "AuthorizationSucceeded";
    /// Why the peer rejected a request
    pub const REASON: &str = "Reason";
}

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    /// Boolean value
    Bool(bool),
    /// Integer value
    Int(i64),
    /// String value
    Str(String),
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Bool(b) => write!(f, "{b}"),
            AttrValue::Int(i) => write!(f, "{i}"),
            AttrValue::Str(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<u32> for AttrValue {
    fn from(v: u32) -> Self {
        AttrValue::Int(i64::from(v))
    }
}

impl From<u64> for AttrValue {
    fn from(v: u64) -> Self {
        AttrValue::Int(v as i64)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}

impl From<&String> for AttrValue {
    fn from(v: &String) -> Self {
        AttrValue::Str(v.clone())
    }
}

impl From<RequirementLevel> for AttrValue {
    fn from(v: RequirementLevel) -> Self {
        AttrValue::Str(v.as_str().to_string())
    }
}

impl From<FeatureDecision> for AttrValue {
    fn from(v: FeatureDecision) -> Self {
        AttrValue::Str(v.as_str().to_string())
    }
}

/// Outcome codes reported by the acceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReturnCode {
    /// Command authorized
    Authorized,
    /// Command denied
    Denied,
    /// Command number not registered
    CmdNotFound,
    /// Referenced session id unknown
    SidNotFound,
}

impl ReturnCode {
    /// Wire spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            ReturnCode::Authorized => "AUTHORIZED",
            ReturnCode::Denied => "DENIED",
            ReturnCode::CmdNotFound => "CMD_NOT_FOUND",
            ReturnCode::SidNotFound => "SID_NOT_FOUND",
        }
    }

    /// Parse the wire spelling (case-insensitive)
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "AUTHORIZED" => Some(ReturnCode::Authorized),
            "DENIED" => Some(ReturnCode::Denied),
            "CMD_NOT_FOUND" => Some(ReturnCode::CmdNotFound),
            "SID_NOT_FOUND" => Some(ReturnCode::SidNotFound),
            _ => None,
        }
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered attribute record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NegotiationRecord {
    attrs: Vec<(String, AttrValue)>,
}

impl NegotiationRecord {
    /// Create an empty record
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.attrs
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(name))
    }

    /// Number of attributes
    pub fn len(&self) -> usize {
        self.attrs.len()
    }

    /// Check if the record has no attributes
    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    /// Whether `name` is present
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Raw attribute value
    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.position(name).map(|i| &self.attrs[i].1)
    }

    /// Set an attribute, replacing an existing value in place
    pub fn set(&mut self, name: &str, value: impl Into<AttrValue>) {
        let value = value.into();
        match self.position(name) {
            Some(i) => self.attrs[i].1 = value,
            None => self.attrs.push((name.to_string(), value)),
        }
    }

    /// Remove an attribute
    pub fn remove(&mut self, name: &str) -> Option<AttrValue> {
        self.position(name).map(|i| self.attrs.remove(i).1)
    }

    /// String attribute. Integers and booleans are not coerced.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(AttrValue::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Integer attribute; numeric strings are accepted
    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(AttrValue::Int(i)) => Some(*i),
            Some(AttrValue::Str(s)) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Boolean attribute; `YES`/`NO`/`TRUE`/`FALSE` strings are accepted
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.get(name) {
            Some(AttrValue::Bool(b)) => Some(*b),
            Some(AttrValue::Int(i)) => Some(*i != 0),
            Some(AttrValue::Str(s)) => match s.to_ascii_uppercase().as_str() {
                "YES" | "TRUE" => Some(true),
                "NO" | "FALSE" => Some(false),
                _ => None,
            },
            None => None,
        }
    }

    /// Comma separated list attribute
    pub fn get_list(&self, name: &str) -> Option<Vec<String>> {
        self.get_str(name).map(split_list)
    }

    /// Store a list as a comma separated string
    pub fn set_list(&mut self, name: &str, items: &[String]) {
        self.set(name, items.join(","));
    }

    /// Declared requirement level; `Ok(None)` when absent
    pub fn level(&self, name: &str) -> Result<Option<RequirementLevel>> {
        match self.get_str(name) {
            None => Ok(None),
            Some(s) => s.parse().map(Some),
        }
    }

    /// Decided feature action; [`FeatureDecision::Undefined`] when absent
    pub fn decision(&self, name: &str) -> FeatureDecision {
        match self.get_str(name) {
            None => FeatureDecision::Undefined,
            Some(s) => FeatureDecision::parse(s),
        }
    }

    /// Outcome code, if present and well formed
    pub fn return_code(&self) -> Option<ReturnCode> {
        self.get_str(attr::RETURN_CODE).and_then(ReturnCode::parse)
    }

    /// Copy `name` from `other`. Returns false (and leaves `self`
    /// untouched) when `other` lacks it.
    pub fn copy_from(&mut self, other: &NegotiationRecord, name: &str) -> bool {
        self.copy_as(name, other, name)
    }

    /// Copy `other[src]` into `self[dest]`
    pub fn copy_as(&mut self, dest: &str, other: &NegotiationRecord, src: &str) -> bool {
        match other.get(src) {
            Some(value) => {
                self.set(dest, value.clone());
                true
            }
            None => false,
        }
    }

    /// Record containing only `names` (in this record's order)
    pub fn project(&self, names: &[&str]) -> NegotiationRecord {
        NegotiationRecord {
            attrs: self
                .attrs
                .iter()
                .filter(|(k, _)| names.iter().any(|n| n.eq_ignore_ascii_case(k)))
                .cloned()
                .collect(),
        }
    }

    /// Iterate over attributes in order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttrValue)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl fmt::Display for NegotiationRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, (k, v)) in self.attrs.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{k} = {v}")?;
        }
        f.write_str("]")
    }
}

impl Serialize for NegotiationRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.attrs.len()))?;
        for (k, v) in &self.attrs {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for NegotiationRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct RecordVisitor;

        impl<'de> Visitor<'de> for RecordVisitor {
            type Value = NegotiationRecord;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of negotiation attributes")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut record = NegotiationRecord::new();
                while let Some((key, value)) = access.next_entry::<String, AttrValue>()? {
                    record.set(&key, value);
                }
                Ok(record)
            }
        }

        deserializer.deserialize_map(RecordVisitor)
    }
}

/// Split a comma separated list, trimming blanks.
pub fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect()
}

/// Fetch a required string attribute or fail with a protocol error.
pub fn require_str<'a>(record: &'a NegotiationRecord, name: &str) -> Result<&'a str> {
    record
        .get_str(name)
        .ok_or_else(|| SecManError::Protocol(format!("missing attribute {name}")))
}
