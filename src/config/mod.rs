//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables (`SECMAN_*`)
//!
//! The security section mirrors how daemons are usually configured: one
//! `[default]` policy, optional per-permission overrides that fall back to
//! it, and process-wide knobs for session lifetimes and bootstrap timeouts.
//!
//! ```toml
//! is_daemon = true
//! forced_auth_commands = [421]
//!
//! [default]
//! authentication = "PREFERRED"
//! auth_methods = ["CLAIMTOBE"]
//! crypto_methods = ["CHACHA20"]
//!
//! [permissions.WRITE]
//! integrity = "REQUIRED"
//!
//! [authorization]
//! READ = ["*"]
//! WRITE = ["*@example.org/10.0.0.*"]
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crypto::{CipherCapability, CHACHA20};
use crate::error::{Result, SecManError};
use crate::protocol::{Feature, RequirementLevel, SecurityPolicy};

/// Authorization levels a command can require.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Permission {
    /// Open to everyone, no check
    Allow,
    /// Read-only queries
    Read,
    /// State-changing commands
    Write,
    /// Daemon-to-daemon traffic
    Daemon,
    /// Administrative commands
    Administrator,
    /// Outgoing connections from tools
    Client,
}

impl Permission {
    /// Every permission level
    pub const ALL: [Permission; 6] = [
        Permission::Allow,
        Permission::Read,
        Permission::Write,
        Permission::Daemon,
        Permission::Administrator,
        Permission::Client,
    ];

    /// Config and wire spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::Allow => "ALLOW",
            Permission::Read => "READ",
            Permission::Write => "WRITE",
            Permission::Daemon => "DAEMON",
            Permission::Administrator => "ADMINISTRATOR",
            Permission::Client => "CLIENT",
        }
    }

    /// Whether holding `self` also grants `other`.
    ///
    /// ADMINISTRATOR and DAEMON imply WRITE, which implies READ. Everything
    /// implies ALLOW.
    pub fn implies(&self, other: Permission) -> bool {
        if *self == other || other == Permission::Allow {
            return true;
        }
        match self {
            Permission::Administrator | Permission::Daemon => {
                Permission::Write.implies(other)
            }
            Permission::Write => other == Permission::Read,
            _ => false,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = SecManError;

    fn from_str(s: &str) -> Result<Self> {
        Permission::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SecManError::Config(format!("unknown permission: {s}")))
    }
}

/// One complete policy block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
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
    /// Session lifetime; unset means the daemon or tool default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_duration_secs: Option<u64>,
    /// Session lease (0 = none)
    pub session_lease_secs: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            negotiation: RequirementLevel::Preferred,
            authentication: RequirementLevel::Optional,
            encryption: RequirementLevel::Optional,
            integrity: RequirementLevel::Optional,
            auth_methods: vec!["CLAIMTOBE".to_string()],
            crypto_methods: vec![CHACHA20.to_string()],
            session_duration_secs: None,
            session_lease_secs: 3600,
        }
    }
}

/// Per-permission override; unset fields fall back to `[default]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyOverride {
    /// Negotiation level
    #[serde(skip_serializing_if = "Option::is_none")]
    pub negotiation: Option<RequirementLevel>,
    /// Authentication level
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authentication: Option<RequirementLevel>,
    /// Encryption level
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<RequirementLevel>,
    /// Integrity level
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrity: Option<RequirementLevel>,
    /// Authentication methods
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_methods: Option<Vec<String>>,
    /// Crypto methods
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crypto_methods: Option<Vec<String>>,
    /// Session lifetime
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_duration_secs: Option<u64>,
    /// Session lease
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_lease_secs: Option<u64>,
}

impl PolicyOverride {
    fn apply(&self, base: &PolicyConfig) -> PolicyConfig {
        PolicyConfig {
            negotiation: self.negotiation.unwrap_or(base.negotiation),
            authentication: self.authentication.unwrap_or(base.authentication),
            encryption: self.encryption.unwrap_or(base.encryption),
            integrity: self.integrity.unwrap_or(base.integrity),
            auth_methods: self
                .auth_methods
                .clone()
                .unwrap_or_else(|| base.auth_methods.clone()),
            crypto_methods: self
                .crypto_methods
                .clone()
                .unwrap_or_else(|| base.crypto_methods.clone()),
            session_duration_secs: self.session_duration_secs.or(base.session_duration_secs),
            session_lease_secs: self.session_lease_secs.unwrap_or(base.session_lease_secs),
        }
    }
}

/// Listener addresses for the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Reliable (TCP) command socket
    pub tcp_addr: String,
    /// Datagram (UDP) command socket; unset disables it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp_addr: Option<String>,
    /// Admin HTTP endpoint; unset disables it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub admin_addr: Option<String>,
    /// Interval between expired-session sweeps
    pub sweep_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_addr: "127.0.0.1:9618".to_string(),
            udp_addr: None,
            admin_addr: None,
            sweep_interval_secs: 60,
        }
    }
}

/// Options that alter the declared policy for one outgoing or incoming
/// command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicyRequest {
    /// Legacy raw protocol: no negotiation at all
    pub raw: bool,
    /// The command demands an authenticated peer
    pub force_authentication: bool,
    /// Short-lived session regardless of configured duration
    pub temporary: bool,
}

/// Main configuration struct
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Whether this process is a long-running daemon (vs a command-line tool)
    pub is_daemon: bool,

    /// Default session lifetime for tools
    pub tool_session_duration_secs: u64,

    /// Grace added by the accepting side to session duration and lease
    pub session_duration_slop_secs: u64,

    /// Connect timeout for bootstrap connections
    pub tcp_session_timeout_secs: u64,

    /// Whole-operation deadline for one negotiation
    pub tcp_session_deadline_secs: u64,

    /// Commands that always require authentication
    pub forced_auth_commands: Vec<u32>,

    /// Fallback policy
    pub default: PolicyConfig,

    /// Per-permission overrides
    pub permissions: BTreeMap<Permission, PolicyOverride>,

    /// Identity/host patterns allowed per permission
    pub authorization: BTreeMap<Permission, Vec<String>>,

    /// Listener settings
    pub server: ServerConfig,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            is_daemon: true,
            tool_session_duration_secs: 60,
            session_duration_slop_secs: 20,
            tcp_session_timeout_secs: 20,
            tcp_session_deadline_secs: 120,
            forced_auth_commands: Vec::new(),
            default: PolicyConfig::default(),
            permissions: BTreeMap::new(),
            authorization: BTreeMap::new(),
            server: ServerConfig::default(),
        }
    }
}

impl SecurityConfig {
    /// Default location: `<config dir>/secman/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("secman").join("config.toml"))
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            SecManError::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;

        toml::from_str(&content)
            .map_err(|e| SecManError::Config(format!("Failed to parse config: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Load from `path` (or the default location when it exists), then
    /// apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(path)?,
                None => Self::default(),
            },
        };
        Ok(config.with_env_overrides())
    }

    /// Apply `SECMAN_*` environment variables on top of this config.
    /// Unparsable values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        let level = |name: &str| {
            std::env::var(name)
                .ok()
                .and_then(|v| v.parse::<RequirementLevel>().ok())
        };
        let list = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|v| crate::protocol::split_list(&v))
        };
        let number = |name: &str| std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok());

        if let Some(v) = level("SECMAN_NEGOTIATION") {
            self.default.negotiation = v;
        }
        if let Some(v) = level("SECMAN_AUTHENTICATION") {
            self.default.authentication = v;
        }
        if let Some(v) = level("SECMAN_ENCRYPTION") {
            self.default.encryption = v;
        }
        if let Some(v) = level("SECMAN_INTEGRITY") {
            self.default.integrity = v;
        }
        if let Some(v) = list("SECMAN_AUTH_METHODS") {
            self.default.auth_methods = v;
        }
        if let Some(v) = list("SECMAN_CRYPTO_METHODS") {
            self.default.crypto_methods = v;
        }
        if let Some(v) = number("SECMAN_SESSION_DURATION") {
            self.default.session_duration_secs = Some(v);
        }
        if let Some(v) = number("SECMAN_SESSION_LEASE") {
            self.default.session_lease_secs = v;
        }
        if let Ok(v) = std::env::var("SECMAN_IS_DAEMON") {
            if let Ok(v) = v.parse() {
                self.is_daemon = v;
            }
        }
        if let Ok(addr) = std::env::var("SECMAN_TCP_ADDR") {
            self.server.tcp_addr = addr;
        }
        if let Ok(addr) = std::env::var("SECMAN_UDP_ADDR") {
            self.server.udp_addr = Some(addr);
        }
        if let Ok(addr) = std::env::var("SECMAN_ADMIN_ADDR") {
            self.server.admin_addr = Some(addr);
        }
        self
    }

    /// Effective policy block for `permission`
    pub fn policy_for(&self, permission: Permission) -> PolicyConfig {
        match self.permissions.get(&permission) {
            Some(over) => over.apply(&self.default),
            None => self.default.clone(),
        }
    }

    /// Whether `command` always requires authentication
    pub fn is_forced_auth(&self, command: u32) -> bool {
        self.forced_auth_commands.contains(&command)
    }

    /// Grace added to accepted sessions
    pub fn slop(&self) -> Duration {
        Duration::from_secs(self.session_duration_slop_secs)
    }

    /// Bootstrap connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_session_timeout_secs)
    }

    /// Per-operation deadline
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.tcp_session_deadline_secs)
    }

    /// Build the policy this process declares for `permission`.
    ///
    /// Fails when the configured levels contradict each other or a
    /// required feature has no usable method.
    pub fn declared_policy(
        &self,
        permission: Permission,
        request: PolicyRequest,
        cipher: &dyn CipherCapability,
    ) -> Result<SecurityPolicy> {
        let block = self.policy_for(permission);

        let mut policy = SecurityPolicy {
            negotiation: block.negotiation,
            authentication: if request.force_authentication {
                RequirementLevel::Required
            } else {
                block.authentication
            },
            encryption: block.encryption,
            integrity: block.integrity,
            auth_methods: Vec::new(),
            crypto_methods: Vec::new(),
            session_duration_secs: 0,
            session_lease_secs: block.session_lease_secs,
        };

        if request.raw {
            for feature in FEATURES {
                policy.set_level(feature, RequirementLevel::Never);
            }
        }

        for (dependency, dependent) in DEPENDENCIES {
            reconcile_dependency(&mut policy, dependency, dependent).map_err(|e| {
                tracing::debug!(
                    negotiation = %policy.negotiation,
                    authentication = %policy.authentication,
                    encryption = %policy.encryption,
                    integrity = %policy.integrity,
                    "cannot resolve security policy"
                );
                e
            })?;
        }

        let auth_methods = normalize_auth_methods(&block.auth_methods);
        if auth_methods.is_empty() {
            if policy.authentication == RequirementLevel::Required {
                return Err(SecManError::Config(format!(
                    "{permission}: authentication is REQUIRED but no methods are configured"
                )));
            }
            policy.authentication = RequirementLevel::Never;
            policy.encryption = RequirementLevel::Never;
            policy.integrity = RequirementLevel::Never;
        }
        policy.auth_methods = auth_methods;

        let crypto_methods = cipher.filter_methods(&block.crypto_methods);
        if crypto_methods.is_empty() {
            if policy.encryption == RequirementLevel::Required
                || policy.integrity == RequirementLevel::Required
            {
                return Err(SecManError::Config(format!(
                    "{permission}: encryption or integrity is REQUIRED but no supported crypto methods are configured"
                )));
            }
            policy.encryption = RequirementLevel::Never;
            policy.integrity = RequirementLevel::Never;
        }
        policy.crypto_methods = crypto_methods;

        policy.session_duration_secs = if request.temporary {
            self.tool_session_duration_secs
        } else {
            block.session_duration_secs.unwrap_or(if self.is_daemon {
                86400
            } else {
                self.tool_session_duration_secs
            })
        };

        Ok(policy)
    }
}

const FEATURES: [Feature; 4] = [
    Feature::Negotiation,
    Feature::Authentication,
    Feature::Encryption,
    Feature::Integrity,
];

/// `(dependency, dependent)` pairs, applied in order
const DEPENDENCIES: [(Feature, Feature); 5] = [
    (Feature::Authentication, Feature::Encryption),
    (Feature::Authentication, Feature::Integrity),
    (Feature::Negotiation, Feature::Authentication),
    (Feature::Negotiation, Feature::Encryption),
    (Feature::Negotiation, Feature::Integrity),
];

/// A feature cannot be stronger than the feature it depends on.
fn reconcile_dependency(
    policy: &mut SecurityPolicy,
    dependency: Feature,
    dependent: Feature,
) -> Result<()> {
    let (dep, sub) = (policy.level(dependency), policy.level(dependent));
    if dep == RequirementLevel::Never {
        if sub == RequirementLevel::Required {
            return Err(SecManError::Config(format!(
                "{dependent} is REQUIRED but {dependency} is NEVER"
            )));
        }
        policy.set_level(dependent, RequirementLevel::Never);
    } else if sub > dep {
        policy.set_level(dependency, sub);
    }
    Ok(())
}

fn normalize_auth_methods(methods: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for method in methods {
        let method = method.trim().to_ascii_uppercase();
        let method = match method.as_str() {
            "TOKENS" | "IDTOKENS" | "IDTOKEN" => "TOKEN".to_string(),
            _ => method,
        };
        if !method.is_empty() && !out.contains(&method) {
            out.push(method);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::crypto::ChaChaCipher;
    use RequirementLevel::{Never, Optional, Preferred, Required};

    fn declared(config: &SecurityConfig, request: PolicyRequest) -> Result<SecurityPolicy> {
        config.declared_policy(Permission::Read, request, &ChaChaCipher::new())
    }

    #[test]
    fn test_default_config() {
        let config = SecurityConfig::default();
        let policy = declared(&config, PolicyRequest::default()).unwrap();
        assert_eq!(policy.negotiation, Preferred);
        assert_eq!(policy.authentication, Optional);
        assert_eq!(policy.session_duration_secs, 86400);
        assert_eq!(policy.session_lease_secs, 3600);
        assert_eq!(policy.crypto_methods, vec![CHACHA20.to_string()]);
    }

    #[test]
    fn test_tool_duration() {
        let config = SecurityConfig {
            is_daemon: false,
            ..Default::default()
        };
        let policy = declared(&config, PolicyRequest::default()).unwrap();
        assert_eq!(policy.session_duration_secs, 60);
    }

    #[test]
    fn test_raw_forces_never() {
        let policy = declared(
            &SecurityConfig::default(),
            PolicyRequest {
                raw: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(policy.negotiation, Never);
        assert_eq!(policy.authentication, Never);
        assert_eq!(policy.encryption, Never);
        assert_eq!(policy.integrity, Never);
    }

    #[test]
    fn test_force_auth_raises_negotiation() {
        let mut config = SecurityConfig::default();
        config.default.negotiation = Optional;
        let policy = declared(
            &config,
            PolicyRequest {
                force_authentication: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(policy.authentication, Required);
        assert_eq!(policy.negotiation, Required);
    }

    #[test]
    fn test_dependency_never_disables_dependents() {
        let mut config = SecurityConfig::default();
        config.default.authentication = Never;
        config.default.encryption = Preferred;
        let policy = declared(&config, PolicyRequest::default()).unwrap();
        assert_eq!(policy.encryption, Never);
        assert_eq!(policy.integrity, Never);
    }

    #[test]
    fn test_dependency_conflict_is_config_error() {
        let mut config = SecurityConfig::default();
        config.default.negotiation = Never;
        config.default.integrity = Required;
        let err = declared(&config, PolicyRequest::default()).unwrap_err();
        assert!(matches!(err, SecManError::Config(_)));
    }

    #[test]
    fn test_no_auth_methods() {
        let mut config = SecurityConfig::default();
        config.default.auth_methods.clear();
        config.default.encryption = Preferred;
        let policy = declared(&config, PolicyRequest::default()).unwrap();
        assert_eq!(policy.authentication, Never);
        assert_eq!(policy.encryption, Never);

        config.default.authentication = Required;
        assert!(declared(&config, PolicyRequest::default()).is_err());
    }

    #[test]
    fn test_unsupported_crypto_methods_filtered() {
        let mut config = SecurityConfig::default();
        config.default.crypto_methods = vec!["BLOWFISH".into()];
        config.default.integrity = Preferred;
        let policy = declared(&config, PolicyRequest::default()).unwrap();
        assert!(policy.crypto_methods.is_empty());
        assert_eq!(policy.integrity, Never);

        config.default.integrity = Required;
        assert!(declared(&config, PolicyRequest::default()).is_err());
    }

    #[test]
    fn test_token_aliases_normalized() {
        assert_eq!(
            normalize_auth_methods(&["idtokens".into(), "TOKEN".into(), "claimtobe".into()]),
            vec!["TOKEN".to_string(), "CLAIMTOBE".to_string()]
        );
    }

    #[test]
    fn test_permission_hierarchy() {
        assert!(Permission::Administrator.implies(Permission::Read));
        assert!(Permission::Daemon.implies(Permission::Write));
        assert!(Permission::Write.implies(Permission::Read));
        assert!(!Permission::Read.implies(Permission::Write));
        assert!(!Permission::Write.implies(Permission::Administrator));
        assert!(Permission::Read.implies(Permission::Allow));
        assert_eq!("daemon".parse::<Permission>().unwrap(), Permission::Daemon);
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            is_daemon = false
            forced_auth_commands = [421]

            [default]
            authentication = "PREFERRED"
            auth_methods = ["CLAIMTOBE"]

            [permissions.WRITE]
            integrity = "REQUIRED"
            session_duration_secs = 600

            [authorization]
            READ = ["*"]
        "#;

        let config: SecurityConfig = toml::from_str(toml).unwrap();
        assert!(config.is_forced_auth(421));
        assert_eq!(config.policy_for(Permission::Read).integrity, Optional);

        let write = config
            .declared_policy(
                Permission::Write,
                PolicyRequest::default(),
                &ChaChaCipher::new(),
            )
            .unwrap();
        assert_eq!(write.integrity, Required);
        assert_eq!(write.authentication, Required);
        assert_eq!(write.session_duration_secs, 600);
        assert_eq!(config.authorization[&Permission::Read], vec!["*".to_string()]);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "tcp_session_timeout_secs = 5\n[server]\ntcp_addr = \"0.0.0.0:1\"").unwrap();

        let config = SecurityConfig::from_file(file.path()).unwrap();
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert_eq!(config.server.tcp_addr, "0.0.0.0:1");
        assert!(SecurityConfig::from_file("/nonexistent/secman.toml").is_err());
    }

    #[test]
    fn test_roundtrip_toml() {
        let config = SecurityConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: SecurityConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
