//! Pluggable authentication.
//!
//! An [`Authenticator`] implements one method (`CLAIMTOBE`, ...). For each
//! connection it hands out an [`AuthHandshake`], a small state machine that
//! the negotiation engine resumes until it completes:
//!
//! ```text
//! registry.select_*(channel, decided methods) ──► Authenticator
//!         │
//!         ▼
//! handshake.resume(channel) ─► Pending ─► resume ─► ... ─► Complete(outcome)
//! ```
//!
//! Method selection is one round trip: the initiator offers the decided
//! methods it implements, the acceptor answers with the first one it also
//! implements.

mod claim;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

pub use claim::ClaimToBe;

use crate::crypto::SessionKey;
use crate::error::{Result, SecManError};
use crate::protocol::{attr, NegotiationRecord, ReturnCode};
use crate::transport::ReliableChannel;

/// Boxed future returned by handshake steps
pub type StepFuture<'a> = Pin<Box<dyn Future<Output = Result<AuthStep>> + Send + 'a>>;

/// What a finished handshake established.
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    /// Method that ran
    pub method: String,
    /// Peer identity, when the method establishes one
    pub identity: Option<String>,
    /// Session key exchanged during the handshake
    pub key: Option<SessionKey>,
}

/// Result of one handshake step.
#[derive(Debug)]
pub enum AuthStep {
    /// Another round trip is needed
    Pending,
    /// Handshake finished
    Complete(AuthOutcome),
}

/// Per-connection authentication state machine.
pub trait AuthHandshake: Send {
    /// Advance by one round, reading and writing on `channel`
    fn resume<'a>(&'a mut self, channel: &'a mut ReliableChannel) -> StepFuture<'a>;
}

/// Which side of the connection a handshake runs on, and what it carries.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    /// Key the acceptor generated for the new session; delivered to the
    /// initiator inside the handshake
    pub session_key: Option<SessionKey>,
}

/// One authentication method.
pub trait Authenticator: Send + Sync + fmt::Debug {
    /// Method name (upper case)
    fn method(&self) -> &str;

    /// Handshake for the connecting side
    fn initiate(&self, ctx: AuthContext) -> Box<dyn AuthHandshake>;

    /// Handshake for the accepting side
    fn accept(&self, ctx: AuthContext) -> Box<dyn AuthHandshake>;
}

/// Authenticators by method name.
#[derive(Debug, Clone, Default)]
pub struct AuthRegistry {
    methods: Vec<Arc<dyn Authenticator>>,
}

impl AuthRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in methods
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ClaimToBe::from_env()));
        registry
    }

    /// Add an authenticator, replacing one with the same method name
    pub fn register(&mut self, authenticator: Arc<dyn Authenticator>) {
        self.methods
            .retain(|a| !a.method().eq_ignore_ascii_case(authenticator.method()));
        self.methods.push(authenticator);
    }

    /// Authenticator for `method`
    pub fn get(&self, method: &str) -> Option<Arc<dyn Authenticator>> {
        self.methods
            .iter()
            .find(|a| a.method().eq_ignore_ascii_case(method))
            .cloned()
    }

    /// Registered method names
    pub fn methods(&self) -> Vec<String> {
        self.methods.iter().map(|a| a.method().to_string()).collect()
    }

    /// `methods` that are registered, order kept
    pub fn supported(&self, methods: &[String]) -> Vec<String> {
        methods
            .iter()
            .filter(|m| self.get(m).is_some())
            .cloned()
            .collect()
    }

    /// Initiator side of method selection
    pub async fn select_initiator(
        &self,
        channel: &mut ReliableChannel,
        decided: &[String],
    ) -> Result<Arc<dyn Authenticator>> {
        let offer = self.supported(decided);
        let mut record = NegotiationRecord::new();
        record.set_list(attr::AUTHENTICATION_METHODS_LIST, &offer);
        channel.send_record(&record).await?;

        let reply = channel.recv_record().await?;
        if let Some(code) = reply.return_code().filter(|c| *c != ReturnCode::Authorized) {
            return Err(SecManError::AuthenticationFailed(format!(
                "{} rejected every offered method ({code})",
                channel.peer()
            )));
        }
        let chosen = reply.get_str(attr::AUTHENTICATION_METHODS).unwrap_or_default();
        self.get(chosen)
            .filter(|_| offer.iter().any(|m| m.eq_ignore_ascii_case(chosen)))
            .ok_or_else(|| {
                SecManError::AuthenticationFailed(format!(
                    "{} chose unoffered method {chosen:?}",
                    channel.peer()
                ))
            })
    }

    /// Acceptor side of method selection
    pub async fn select_acceptor(
        &self,
        channel: &mut ReliableChannel,
        decided: &[String],
    ) -> Result<Arc<dyn Authenticator>> {
        let offer = channel
            .recv_record()
            .await?
            .get_list(attr::AUTHENTICATION_METHODS_LIST)
            .unwrap_or_default();

        let chosen = offer
            .iter()
            .filter(|m| decided.iter().any(|d| d.eq_ignore_ascii_case(m)))
            .find_map(|m| self.get(m));

        let mut reply = NegotiationRecord::new();
        match &chosen {
            Some(authenticator) => {
                reply.set(attr::AUTHENTICATION_METHODS, authenticator.method());
                reply.set(attr::RETURN_CODE, ReturnCode::Authorized.as_str());
            }
            None => reply.set(attr::RETURN_CODE, ReturnCode::Denied.as_str()),
        }
        channel.send_record(&reply).await?;

        chosen.ok_or_else(|| {
            SecManError::AuthenticationFailed(format!(
                "no common authentication method with {} (offered {offer:?})",
                channel.peer()
            ))
        })
    }
}

/// Resume `handshake` until it completes.
pub async fn run_handshake(
    handshake: &mut dyn AuthHandshake,
    channel: &mut ReliableChannel,
) -> Result<AuthOutcome> {
    loop {
        if let AuthStep::Complete(outcome) = handshake.resume(channel).await? {
            return Ok(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{ChaChaCipher, CipherCapability};

    fn pair() -> (ReliableChannel, ReliableChannel) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let cipher: Arc<dyn CipherCapability> = Arc::new(ChaChaCipher::new());
        (
            ReliableChannel::new(a, "acceptor", cipher.clone()),
            ReliableChannel::new(b, "initiator", cipher),
        )
    }

    fn registry() -> AuthRegistry {
        let mut registry = AuthRegistry::new();
        registry.register(Arc::new(ClaimToBe::new("alice")));
        registry
    }

    #[test]
    fn test_register_replaces_same_method() {
        let mut registry = registry();
        registry.register(Arc::new(ClaimToBe::new("bob")));
        assert_eq!(registry.methods(), vec!["CLAIMTOBE".to_string()]);
        assert_eq!(
            registry.supported(&["TOKEN".into(), "claimtobe".into()]),
            vec!["claimtobe".to_string()]
        );
    }

    #[tokio::test]
    async fn test_method_selection() {
        let (mut client, mut server) = pair();
        let decided = vec!["TOKEN".to_string(), "CLAIMTOBE".to_string()];
        let server_side = tokio::spawn(async move {
            let chosen = registry().select_acceptor(&mut server, &decided).await;
            chosen.map(|a| a.method().to_string())
        });

        let chosen = registry()
            .select_initiator(&mut client, &["TOKEN".into(), "CLAIMTOBE".into()])
            .await
            .unwrap();
        assert_eq!(chosen.method(), "CLAIMTOBE");
        assert_eq!(server_side.await.unwrap().unwrap(), "CLAIMTOBE");
    }

    #[tokio::test]
    async fn test_no_common_method() {
        let (mut client, mut server) = pair();
        let server_side = tokio::spawn(async move {
            AuthRegistry::new()
                .select_acceptor(&mut server, &["CLAIMTOBE".into()])
                .await
                .is_err()
        });

        let err = registry()
            .select_initiator(&mut client, &["CLAIMTOBE".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, SecManError::AuthenticationFailed(_)));
        assert!(server_side.await.unwrap());
    }
}
