//! Requirement levels, feature decisions and declared security policies.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::record::{attr, NegotiationRecord};
use crate::error::{Result, SecManError};

/// How strongly one side wants a feature. Ordered `NEVER < OPTIONAL <
/// PREFERRED < REQUIRED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequirementLevel {
    /// Must not be used
    Never,
    /// Used only if the peer wants it
    Optional,
    /// Used unless the peer refuses
    Preferred,
    /// Must be used
    Required,
}

impl RequirementLevel {
    /// All levels in ascending order
    pub const ALL: [RequirementLevel; 4] = [
        RequirementLevel::Never,
        RequirementLevel::Optional,
        RequirementLevel::Preferred,
        RequirementLevel::Required,
    ];

    /// Wire spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            RequirementLevel::Never => "NEVER",
            RequirementLevel::Optional => "OPTIONAL",
            RequirementLevel::Preferred => "PREFERRED",
            RequirementLevel::Required => "REQUIRED",
        }
    }

    /// Decision taken without a peer: PREFERRED and REQUIRED mean yes.
    pub fn local_decision(&self) -> FeatureDecision {
        match self {
            RequirementLevel::Required | RequirementLevel::Preferred => FeatureDecision::Yes,
            RequirementLevel::Optional | RequirementLevel::Never => FeatureDecision::No,
        }
    }
}

impl fmt::Display for RequirementLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequirementLevel {
    type Err = SecManError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NEVER" | "NO" => Ok(RequirementLevel::Never),
            "OPTIONAL" => Ok(RequirementLevel::Optional),
            "PREFERRED" => Ok(RequirementLevel::Preferred),
            "REQUIRED" | "YES" => Ok(RequirementLevel::Required),
            other => Err(SecManError::Protocol(format!(
                "invalid requirement level: {other}"
            ))),
        }
    }
}

/// Outcome of reconciling one feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FeatureDecision {
    /// Attribute absent
    Undefined,
    /// Attribute present but unparsable
    Invalid,
    /// Sides cannot agree
    Fail,
    /// Feature on
    Yes,
    /// Feature off
    No,
}

impl FeatureDecision {
    /// Wire spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureDecision::Undefined => "UNDEFINED",
            FeatureDecision::Invalid => "INVALID",
            FeatureDecision::Fail => "FAIL",
            FeatureDecision::Yes => "YES",
            FeatureDecision::No => "NO",
        }
    }

    /// Parse a wire value; anything unknown is [`FeatureDecision::Invalid`]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "YES" => FeatureDecision::Yes,
            "NO" => FeatureDecision::No,
            "FAIL" => FeatureDecision::Fail,
            "UNDEFINED" => FeatureDecision::Undefined,
            _ => FeatureDecision::Invalid,
        }
    }

    /// Whether the feature is on
    pub fn is_yes(&self) -> bool {
        *self == FeatureDecision::Yes
    }
}

impl fmt::Display for FeatureDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Negotiable security features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    /// Use the negotiation protocol at all
    Negotiation,
    /// Authenticate the peer
    Authentication,
    /// Encrypt traffic
    Encryption,
    /// Integrity-protect traffic
    Integrity,
}

impl Feature {
    /// Record attribute carrying this feature
    pub fn attr(&self) -> &'static str {
        match self {
            Feature::Negotiation => attr::NEGOTIATION,
            Feature::Authentication => attr::AUTHENTICATION,
            Feature::Encryption => attr::ENCRYPTION,
            Feature::Integrity => attr::INTEGRITY,
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.attr())
    }
}

/// A declared security policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityPolicy {
    /// Negotiation level
    pub negotiation: RequirementLevel,
    /// Authentication level
    pub authentication: RequirementLevel,
    /// Encryption level
    pub encryption: RequirementLevel,
    /// Integrity level
    pub integrity: RequirementLevel,
    /// Authentication methods in preference order
    pub auth_methods: Vec<String>,
    /// Crypto methods in preference order
    pub crypto_methods: Vec<String>,
    /// Session lifetime in seconds
    pub session_duration_secs: u64,
    /// Maximum idle time in seconds (0 = no lease)
    pub session_lease_secs: u64,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            negotiation: RequirementLevel::Preferred,
            authentication: RequirementLevel::Optional,
            encryption: RequirementLevel::Optional,
            integrity: RequirementLevel::Optional,
            auth_methods: Vec::new(),
            crypto_methods: Vec::new(),
            session_duration_secs: 86400,
            session_lease_secs: 3600,
        }
    }
}

impl SecurityPolicy {
    /// Level declared for `feature`
    pub fn level(&self, feature: Feature) -> RequirementLevel {
        match feature {
            Feature::Negotiation => self.negotiation,
            Feature::Authentication => self.authentication,
            Feature::Encryption => self.encryption,
            Feature::Integrity => self.integrity,
        }
    }

    /// Set the level for `feature`
    pub fn set_level(&mut self, feature: Feature, level: RequirementLevel) {
        match feature {
            Feature::Negotiation => self.negotiation = level,
            Feature::Authentication => self.authentication = level,
            Feature::Encryption => self.encryption = level,
            Feature::Integrity => self.integrity = level,
        }
    }

    /// Whether any feature is declared REQUIRED
    pub fn requires_any(&self) -> bool {
        [
            Feature::Negotiation,
            Feature::Authentication,
            Feature::Encryption,
            Feature::Integrity,
        ]
        .iter()
        .any(|f| self.level(*f) == RequirementLevel::Required)
    }

    /// Declared policy as a negotiation record
    pub fn to_record(&self) -> NegotiationRecord {
        let mut record = NegotiationRecord::new();
        record.set(attr::NEGOTIATION, self.negotiation);
        record.set(attr::AUTHENTICATION, self.authentication);
        record.set(attr::ENCRYPTION, self.encryption);
        record.set(attr::INTEGRITY, self.integrity);
        record.set_list(attr::AUTHENTICATION_METHODS, &self.auth_methods);
        record.set_list(attr::CRYPTO_METHODS, &self.crypto_methods);
        record.set(
            attr::SESSION_DURATION,
            self.session_duration_secs.to_string(),
        );
        record.set(attr::SESSION_LEASE, self.session_lease_secs);
        record
    }

    /// Parse a declared policy record. Absent levels fall back to the
    /// defaults; malformed levels are protocol errors.
    pub fn from_record(record: &NegotiationRecord) -> Result<Self> {
        let defaults = Self::default();
        let level = |feature: Feature, default: RequirementLevel| -> Result<RequirementLevel> {
            Ok(record.level(feature.attr())?.unwrap_or(default))
        };

        Ok(Self {
            negotiation: level(Feature::Negotiation, defaults.negotiation)?,
            authentication: level(Feature::Authentication, defaults.authentication)?,
            encryption: level(Feature::Encryption, defaults.encryption)?,
            integrity: level(Feature::Integrity, defaults.integrity)?,
            auth_methods: record
                .get_list(attr::AUTHENTICATION_METHODS)
                .unwrap_or_default(),
            crypto_methods: record.get_list(attr::CRYPTO_METHODS).unwrap_or_default(),
            session_duration_secs: non_negative(record.get_int(attr::SESSION_DURATION))
                .unwrap_or(defaults.session_duration_secs),
            session_lease_secs: non_negative(record.get_int(attr::SESSION_LEASE)).unwrap_or(0),
        })
    }
}

fn non_negative(v: Option<i64>) -> Option<u64> {
    v.map(|v| v.max(0) as u64)
}
