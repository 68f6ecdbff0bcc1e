//! `CLAIMTOBE`: the initiator asserts a name and the acceptor believes it.
//!
//! No identity is proven, but the handshake still runs an X25519 exchange
//! so the acceptor can hand the freshly generated session key to the
//! initiator without it crossing the wire in the clear:
//!
//! ```text
//! Initiator                                    Acceptor
//!    │── ClaimName, ClaimPublicKey ───────────────►│
//!    │◄── ClaimPublicKey, KeyMethod, WrappedKey ───│  AEAD(exchange key, session key)
//!    │── ClaimConfirm ────────────────────────────►│  HMAC(exchange key, name)
//! ```

use base64::Engine;

use super::{AuthContext, AuthHandshake, AuthOutcome, AuthStep, Authenticator, StepFuture};
use crate::crypto::{AeadCipher, HmacAuth, KeyExchange, KeyMaterial, PublicKey, SessionKey};
use crate::error::{Result, SecManError};
use crate::protocol::{attr, NegotiationRecord, ReturnCode};
use crate::transport::ReliableChannel;

/// Method name
pub const CLAIMTOBE: &str = "CLAIMTOBE";

const CLAIM_NAME: &str = "ClaimName";
const CLAIM_PUBLIC_KEY: &str = "ClaimPublicKey";
const CLAIM_CONFIRM: &str = "ClaimConfirm";
const KEY_METHOD: &str = "KeyMethod";
const WRAPPED_KEY: &str = "WrappedKey";
const EXCHANGE_CONTEXT: &str = "secman/v1/claimtobe";

fn b64() -> base64::engine::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}

fn failed(msg: impl Into<String>) -> SecManError {
    SecManError::AuthenticationFailed(msg.into())
}

fn decode_attr(record: &NegotiationRecord, name: &str) -> Result<Vec<u8>> {
    let encoded = record
        .get_str(name)
        .ok_or_else(|| failed(format!("{CLAIMTOBE}: missing {name}")))?;
    Ok(b64().decode(encoded)?)
}

fn peer_public(record: &NegotiationRecord) -> Result<PublicKey> {
    PublicKey::from_slice(&decode_attr(record, CLAIM_PUBLIC_KEY)?)
        .map_err(|e| failed(format!("{CLAIMTOBE}: {e}")))
}

/// Claim-to-be authenticator.
#[derive(Debug, Clone)]
pub struct ClaimToBe {
    name: String,
}

impl ClaimToBe {
    /// Claim `name` when connecting
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Claim the current OS user
    pub fn from_env() -> Self {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "nobody".to_string());
        Self::new(user)
    }

    /// Name claimed when connecting
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Authenticator for ClaimToBe {
    fn method(&self) -> &str {
        CLAIMTOBE
    }

    fn initiate(&self, _ctx: AuthContext) -> Box<dyn AuthHandshake> {
        Box::new(ClaimInitiator {
            name: self.name.clone(),
            exchange: None,
        })
    }

    fn accept(&self, ctx: AuthContext) -> Box<dyn AuthHandshake> {
        Box::new(ClaimAcceptor {
            key: ctx.session_key,
            pending: None,
        })
    }
}

struct ClaimInitiator {
    name: String,
    exchange: Option<KeyExchange>,
}

impl ClaimInitiator {
    async fn step(&mut self, channel: &mut ReliableChannel) -> Result<AuthStep> {
        let Some(mut exchange) = self.exchange.take() else {
            let exchange = KeyExchange::new();
            let mut hello = NegotiationRecord::new();
            hello.set(CLAIM_NAME, self.name.as_str());
            hello.set(CLAIM_PUBLIC_KEY, b64().encode(exchange.public_key().as_bytes()));
            channel.send_record(&hello).await?;
            self.exchange = Some(exchange);
            return Ok(AuthStep::Pending);
        };

        let reply = channel.recv_record().await?;
        if reply.return_code() != Some(ReturnCode::Authorized) {
            return Err(failed(format!(
                "{CLAIMTOBE}: {} refused claim {:?}",
                channel.peer(),
                self.name
            )));
        }
        exchange.set_peer_public(&peer_public(&reply)?);
        let shared = exchange.derive_key(EXCHANGE_CONTEXT).map_err(crate::crypto::CryptoError::from)?;

        let key = match reply.get_str(KEY_METHOD) {
            Some(method) => {
                let wrapped = decode_attr(&reply, WRAPPED_KEY)?;
                let raw = AeadCipher::new(&shared)
                    .and_then(|aead| aead.decrypt(&wrapped, method.as_bytes()))
                    .map_err(|e| failed(format!("{CLAIMTOBE}: cannot unwrap session key: {e}")))?;
                Some(SessionKey::new(method, KeyMaterial::new(raw)))
            }
            None => None,
        };

        let tag = HmacAuth::new(shared)
            .and_then(|mac| mac.compute_tag(self.name.as_bytes()))
            .map_err(crate::crypto::CryptoError::from)?;
        let mut confirm = NegotiationRecord::new();
        confirm.set(CLAIM_CONFIRM, b64().encode(tag));
        channel.send_record(&confirm).await?;

        Ok(AuthStep::Complete(AuthOutcome {
            method: CLAIMTOBE.to_string(),
            identity: Some(self.name.clone()),
            key,
        }))
    }
}

impl AuthHandshake for ClaimInitiator {
    fn resume<'a>(&'a mut self, channel: &'a mut ReliableChannel) -> StepFuture<'a> {
        Box::pin(self.step(channel))
    }
}

struct ClaimAcceptor {
    key: Option<SessionKey>,
    /// Claimed name and exchange key, between the two rounds
    pending: Option<(String, KeyMaterial)>,
}

impl ClaimAcceptor {
    async fn step(&mut self, channel: &mut ReliableChannel) -> Result<AuthStep> {
        let Some((name, shared)) = self.pending.take() else {
            let hello = channel.recv_record().await?;
            let name = hello
                .get_str(CLAIM_NAME)
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(String::from);

            let mut reply = NegotiationRecord::new();
            let Some(name) = name else {
                reply.set(attr::RETURN_CODE, ReturnCode::Denied.as_str());
                channel.send_record(&reply).await?;
                return Err(failed(format!("{CLAIMTOBE}: {} claimed no name", channel.peer())));
            };

            let mut exchange = KeyExchange::new();
            exchange.set_peer_public(&peer_public(&hello)?);
            let shared = exchange
                .derive_key(EXCHANGE_CONTEXT)
                .map_err(crate::crypto::CryptoError::from)?;

            reply.set(attr::RETURN_CODE, ReturnCode::Authorized.as_str());
            reply.set(CLAIM_PUBLIC_KEY, b64().encode(exchange.public_key().as_bytes()));
            if let Some(key) = &self.key {
                let wrapped = AeadCipher::new(&shared)
                    .and_then(|aead| {
                        aead.encrypt_auto_nonce(key.material().as_bytes(), key.method().as_bytes())
                    })
                    .map_err(crate::crypto::CryptoError::from)?;
                reply.set(KEY_METHOD, key.method());
                reply.set(WRAPPED_KEY, b64().encode(wrapped));
            }
            channel.send_record(&reply).await?;

            self.pending = Some((name, shared));
            return Ok(AuthStep::Pending);
        };

        let confirm = channel.recv_record().await?;
        let tag = decode_attr(&confirm, CLAIM_CONFIRM)?;
        HmacAuth::new(shared)
            .and_then(|mac| mac.verify_tag(name.as_bytes(), &tag))
            .map_err(|_| failed(format!("{CLAIMTOBE}: {} failed key confirmation", channel.peer())))?;

        tracing::debug!(peer = %channel.peer(), identity = %name, "claim accepted");
        Ok(AuthStep::Complete(AuthOutcome {
            method: CLAIMTOBE.to_string(),
            identity: Some(name),
            key: self.key.clone(),
        }))
    }
}

impl AuthHandshake for ClaimAcceptor {
    fn resume<'a>(&'a mut self, channel: &'a mut ReliableChannel) -> StepFuture<'a> {
        Box::pin(self.step(channel))
    }
}
