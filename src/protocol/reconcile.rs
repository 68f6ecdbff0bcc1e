//! Policy reconciliation.
//!
//! Pure functions turning two declared policies (initiator's and
//! acceptor's) into one decided policy. Both sides run the same code: the
//! acceptor against the initiator's declared record, and either side locally
//! when both policies are known (non-negotiated sessions).

use thiserror::Error;

use super::policy::{Feature, FeatureDecision, RequirementLevel, SecurityPolicy};
use super::record::{attr, NegotiationRecord};

/// Why two policies could not be reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    /// One side requires a feature the other refuses
    #[error("{feature}: initiator {initiator} vs acceptor {acceptor}")]
    Conflict {
        /// Feature in conflict
        feature: Feature,
        /// Initiator's level
        initiator: RequirementLevel,
        /// Acceptor's level
        acceptor: RequirementLevel,
    },

    /// A feature was decided on but no method is common to both sides
    #[error("{feature} decided YES but no common method")]
    NoCommonMethod {
        /// Feature lacking a method
        feature: Feature,
    },
}

/// Decide one feature from the two declared levels.
///
/// | init\accept | REQUIRED | PREFERRED | OPTIONAL | NEVER |
/// |---|---|---|---|---|
/// | REQUIRED  | YES  | YES | YES | FAIL |
/// | PREFERRED | YES  | YES | YES | NO   |
/// | OPTIONAL  | YES  | YES | NO  | NO   |
/// | NEVER     | FAIL | NO  | NO  | NO   |
pub fn reconcile_feature(initiator: RequirementLevel, acceptor: RequirementLevel) -> FeatureDecision {
    use RequirementLevel::{Never, Optional, Preferred, Required};

    match (initiator, acceptor) {
        (Required, Never) | (Never, Required) => FeatureDecision::Fail,
        (Required, _) => FeatureDecision::Yes,
        (Preferred, Never) => FeatureDecision::No,
        (Preferred, _) => FeatureDecision::Yes,
        (Optional, Required | Preferred) => FeatureDecision::Yes,
        (Optional, _) | (Never, _) => FeatureDecision::No,
    }
}

/// Normalize aliases so equivalent method names compare equal.
fn canonical_method(method: &str) -> &str {
    if ["TOKENS", "IDTOKENS", "IDTOKEN"]
        .iter()
        .any(|alias| method.eq_ignore_ascii_case(alias))
    {
        "TOKEN"
    } else {
        method
    }
}

/// Methods common to both lists, in the acceptor's order.
pub fn reconcile_method_lists(initiator: &[String], acceptor: &[String]) -> Vec<String> {
    let mut result: Vec<String> = Vec::new();
    for theirs in acceptor {
        let theirs = canonical_method(theirs);
        let shared = initiator
            .iter()
            .any(|ours| canonical_method(ours).eq_ignore_ascii_case(theirs));
        if shared && !result.iter().any(|m| m.eq_ignore_ascii_case(theirs)) {
            result.push(theirs.to_string());
        }
    }
    result
}

/// Decided session duration: the shorter of the two.
pub fn reconcile_duration(initiator: u64, acceptor: u64) -> u64 {
    initiator.min(acceptor)
}

/// Decided lease: a zero side takes the other side's value, then the
/// shorter wins. Zero only when both are zero.
pub fn reconcile_lease(initiator: u64, acceptor: u64) -> u64 {
    let a = if initiator == 0 { acceptor } else { initiator };
    let b = if acceptor == 0 { initiator } else { acceptor };
    a.min(b)
}

/// Result of reconciling two declared policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecidedPolicy {
    /// Authentication action
    pub authentication: FeatureDecision,
    /// Encryption action
    pub encryption: FeatureDecision,
    /// Integrity action
    pub integrity: FeatureDecision,
    /// Whether either side declared authentication REQUIRED
    pub auth_required: bool,
    /// Common authentication methods
    pub auth_methods: Vec<String>,
    /// Common crypto methods
    pub crypto_methods: Vec<String>,
    /// Session lifetime in seconds
    pub session_duration_secs: u64,
    /// Session lease in seconds (0 = none)
    pub session_lease_secs: u64,
}

impl DecidedPolicy {
    /// Decision for `feature`
    pub fn decision(&self, feature: Feature) -> FeatureDecision {
        match feature {
            Feature::Authentication => self.authentication,
            Feature::Encryption => self.encryption,
            Feature::Integrity => self.integrity,
            Feature::Negotiation => FeatureDecision::Yes,
        }
    }

    /// First crypto method, used where a single method is needed
    pub fn primary_crypto_method(&self) -> Option<&str> {
        self.crypto_methods.first().map(String::as_str)
    }

    /// Decided policy as a record, marked `Enact = YES`
    pub fn to_record(&self) -> NegotiationRecord {
        let mut record = NegotiationRecord::new();
        record.set(attr::AUTHENTICATION, self.authentication);
        if self.authentication.is_yes() && !self.auth_required {
            // absent means required
            record.set(attr::AUTH_REQUIRED, false);
        }
        record.set(attr::ENCRYPTION, self.encryption);
        record.set(attr::INTEGRITY, self.integrity);

        record.set_list(attr::AUTHENTICATION_METHODS_LIST, &self.auth_methods);
        if let Some(first) = self.auth_methods.first() {
            record.set(attr::AUTHENTICATION_METHODS, first.as_str());
        }
        record.set_list(attr::CRYPTO_METHODS, &self.crypto_methods);
        record.set_list(attr::CRYPTO_METHODS_LIST, &self.crypto_methods);

        record.set(
            attr::SESSION_DURATION,
            self.session_duration_secs.to_string(),
        );
        record.set(attr::SESSION_LEASE, self.session_lease_secs);
        record.set(attr::ENACT, "YES");
        record
    }
}

/// Reconcile two declared policies.
pub fn reconcile(
    initiator: &SecurityPolicy,
    acceptor: &SecurityPolicy,
) -> Result<DecidedPolicy, ReconcileError> {
    let decide = |feature: Feature| -> Result<FeatureDecision, ReconcileError> {
        let (i, a) = (initiator.level(feature), acceptor.level(feature));
        match reconcile_feature(i, a) {
            FeatureDecision::Fail => Err(ReconcileError::Conflict {
                feature,
                initiator: i,
                acceptor: a,
            }),
            decision => Ok(decision),
        }
    };

    let authentication = decide(Feature::Authentication)?;
    let encryption = decide(Feature::Encryption)?;
    let integrity = decide(Feature::Integrity)?;

    let auth_methods = reconcile_method_lists(&initiator.auth_methods, &acceptor.auth_methods);
    if authentication.is_yes() && auth_methods.is_empty() {
        return Err(ReconcileError::NoCommonMethod {
            feature: Feature::Authentication,
        });
    }

    let crypto_methods =
        reconcile_method_lists(&initiator.crypto_methods, &acceptor.crypto_methods);
    if crypto_methods.is_empty() {
        for (feature, decision) in [
            (Feature::Encryption, encryption),
            (Feature::Integrity, integrity),
        ] {
            if decision.is_yes() {
                return Err(ReconcileError::NoCommonMethod { feature });
            }
        }
    }

    Ok(DecidedPolicy {
        authentication,
        encryption,
        integrity,
        auth_required: initiator.authentication == RequirementLevel::Required
            || acceptor.authentication == RequirementLevel::Required,
        auth_methods,
        crypto_methods,
        session_duration_secs: reconcile_duration(
            initiator.session_duration_secs,
            acceptor.session_duration_secs,
        ),
        session_lease_secs: reconcile_lease(
            initiator.session_lease_secs,
            acceptor.session_lease_secs,
        ),
    })
}
