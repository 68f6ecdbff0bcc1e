//! Command initiator: the connecting side of a command.
//!
//! ```text
//! SendPolicy ─┬─ resumed ─────────────────────────────► ActivateCrypto ─► Done
//!             ├─ raw ───────────────────────────────────────────────────► Done
//!             └─► ReceiveDecision ─► Authenticate ─► ActivateCrypto
//!                                                          │
//!                                     ReceiveSessionInfo ◄─┘ (new session)
//!                                            │
//!                                            ▼
//!                                          Done
//! ```
//!
//! Datagram commands cannot negotiate. They reuse a session created over a
//! stream, bootstrapping one first when none exists.

use std::sync::Arc;
use std::time::{Duration, Instant};

use super::policy::FeatureDecision;
use super::record::{attr, require_str, NegotiationRecord, ReturnCode};
use super::{DC_AUTHENTICATE, DC_SEC_QUERY, PROTOCOL_VERSION};
use crate::auth::{run_handshake, AuthContext, AuthOutcome, AuthRegistry};
use crate::config::{Permission, PolicyRequest, SecurityConfig};
use crate::crypto::{ChaChaCipher, CipherCapability, SessionKey};
use crate::error::{ErrorStack, Result, SecManError};
use crate::server::{ProcessIdentity, SelfIdentity};
use crate::session::{
    session_key, BootstrapOutcome, BootstrapTicket, CachedSession, SessionEntry, SessionService,
};
use crate::transport::{
    Connector, DatagramHeader, DatagramPacket, DatagramWriter, ReliableChannel, TcpConnector,
    WireMessage,
};

const SUBSYSTEM: &str = "SECMAN";

/// Cached attributes sent when resuming a session
const RESUME_ATTRS: [&str; 8] = [
    attr::USE_SESSION,
    attr::SESSION_ID,
    attr::COMMAND,
    attr::AUTH_COMMAND,
    attr::SERVER_RETURN_ADDRESS,
    attr::CONNECT_ADDRESS,
    attr::COOKIE,
    attr::CRYPTO_METHODS,
];

/// Attributes describing the sending process, never cached
const LOCAL_ONLY_ATTRS: [&str; 3] = [
    attr::SERVER_RETURN_ADDRESS,
    attr::OWNER_UNIQUE_ID,
    attr::SERVER_PROCESS_ID,
];

/// Attributes of the decided record kept in the cached policy
const DECIDED_ATTRS: [&str; 12] = [
    attr::REMOTE_VERSION,
    attr::ENACT,
    attr::AUTHENTICATION_METHODS_LIST,
    attr::AUTHENTICATION_METHODS,
    attr::CRYPTO_METHODS,
    attr::CRYPTO_METHODS_LIST,
    attr::AUTHENTICATION,
    attr::AUTH_REQUIRED,
    attr::ENCRYPTION,
    attr::INTEGRITY,
    attr::SESSION_DURATION,
    attr::SESSION_LEASE,
];

/// One outgoing command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest {
    /// Destination command address
    pub peer: String,
    /// Command number
    pub command: u32,
    /// Permission level whose policy we declare
    pub permission: Permission,
    /// Legacy raw protocol: send the bare command number
    pub raw: bool,
    /// Demand authentication for this command
    pub force_authentication: bool,
    /// Ask for a short-lived session
    pub temporary: bool,
    /// Session to try before the command index
    pub session_hint: Option<String>,
    /// Command the session is really for, when `command` is a built-in
    pub auth_command: Option<u32>,
    /// Our own datagram address, for notices and callbacks
    pub return_address: Option<String>,
}

impl CommandRequest {
    /// Command `command` to `peer` under the CLIENT policy
    pub fn new(peer: impl Into<String>, command: u32) -> Self {
        Self {
            peer: peer.into(),
            command,
            permission: Permission::Client,
            raw: false,
            force_authentication: false,
            temporary: false,
            session_hint: None,
            auth_command: None,
            return_address: None,
        }
    }

    /// Declare the policy of another permission level
    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permission = permission;
        self
    }

    /// Try `session_id` first
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_hint = Some(session_id.into());
        self
    }

    /// Where the peer should send notices
    pub fn with_return_address(mut self, addr: impl Into<String>) -> Self {
        self.return_address = Some(addr.into());
        self
    }

    /// Use the raw protocol
    pub fn raw(mut self) -> Self {
        self.raw = true;
        self
    }

    /// Require authentication
    pub fn forcing_authentication(mut self) -> Self {
        self.force_authentication = true;
        self
    }

    /// Ask for a short-lived session
    pub fn temporary(mut self) -> Self {
        self.temporary = true;
        self
    }

    fn policy_request(&self, config: &SecurityConfig) -> PolicyRequest {
        PolicyRequest {
            raw: self.raw,
            force_authentication: self.force_authentication || config.is_forced_auth(self.command),
            temporary: self.temporary,
        }
    }
}

/// How a stream command was started.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Session the command runs under
    pub session_id: Option<String>,
    /// The session came from the cache
    pub resumed: bool,
    /// A policy record was exchanged (false on the raw path)
    pub negotiated: bool,
    /// Name the peer authenticated us as
    pub remote_user: Option<String>,
    /// Peer's protocol version
    pub remote_version: Option<String>,
}

/// A datagram ready for its payload.
#[derive(Debug)]
pub struct DatagramCommand {
    writer: DatagramWriter,
    session_id: Option<String>,
    bootstrapped: bool,
}

impl DatagramCommand {
    /// Session protecting the datagram
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Whether a session had to be bootstrapped first
    pub fn bootstrapped(&self) -> bool {
        self.bootstrapped
    }

    /// Packet header as it stands
    pub fn header(&self) -> &DatagramHeader {
        self.writer.header()
    }

    /// Append a payload message
    pub fn push(&mut self, message: WireMessage) {
        self.writer.push(message);
    }

    /// Append a payload blob
    pub fn push_data(&mut self, bytes: &[u8]) {
        self.writer.push(WireMessage::data(bytes));
    }

    /// Seal or sign and produce the packet
    pub fn finish(self) -> Result<DatagramPacket> {
        self.writer.finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitiatorState {
    SendPolicy,
    ReceiveDecision,
    Authenticate,
    ActivateCrypto,
    ReceiveSessionInfo,
    Done,
}

/// State carried between initiator steps.
#[derive(Debug, Default)]
struct Negotiation {
    /// Policy that will be cached for the new session
    policy: NegotiationRecord,
    /// Where feature decisions are read from
    decided: NegotiationRecord,
    key: Option<SessionKey>,
    new_session: bool,
    outcome: CommandOutcome,
}

/// Starts commands on behalf of this process.
#[derive(Debug, Clone)]
pub struct CommandInitiator {
    config: Arc<SecurityConfig>,
    sessions: Arc<SessionService>,
    auth: Arc<AuthRegistry>,
    cipher: Arc<dyn CipherCapability>,
    identity: Arc<dyn SelfIdentity>,
    connector: Arc<dyn Connector>,
}

impl CommandInitiator {
    /// Initiator with the default authenticators, cipher and TCP connector
    pub fn new(config: Arc<SecurityConfig>, sessions: Arc<SessionService>) -> Self {
        Self {
            config,
            sessions,
            auth: Arc::new(AuthRegistry::with_defaults()),
            cipher: Arc::new(ChaChaCipher::new()),
            identity: Arc::new(ProcessIdentity::new()),
            connector: Arc::new(TcpConnector),
        }
    }

    /// Replace the authenticators
    pub fn with_auth(mut self, auth: Arc<AuthRegistry>) -> Self {
        self.auth = auth;
        self
    }

    /// Replace the cipher capability
    pub fn with_cipher(mut self, cipher: Arc<dyn CipherCapability>) -> Self {
        self.cipher = cipher;
        self
    }

    /// Replace the self-identity capability
    pub fn with_identity(mut self, identity: Arc<dyn SelfIdentity>) -> Self {
        self.identity = identity;
        self
    }

    /// Replace the connector used for bootstraps
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Shared session service
    pub fn sessions(&self) -> &Arc<SessionService> {
        &self.sessions
    }

    /// Cipher capability
    pub fn cipher(&self) -> &Arc<dyn CipherCapability> {
        &self.cipher
    }

    /// Configuration
    pub fn config(&self) -> &SecurityConfig {
        &self.config
    }

    /// Connect to the request's peer and start the command on the new
    /// channel.
    pub async fn connect(
        &self,
        request: &CommandRequest,
        errors: &mut ErrorStack,
    ) -> Result<(ReliableChannel, CommandOutcome)> {
        let stream = self
            .connector
            .connect(&request.peer, self.config.connect_timeout())
            .await
            .map_err(|e| {
                errors.push_error(SUBSYSTEM, &e);
                e
            })?;
        let mut channel = ReliableChannel::new(stream, request.peer.clone(), self.cipher.clone());
        let outcome = self.start_command(&mut channel, request, errors).await?;
        Ok((channel, outcome))
    }

    /// Start `request` on a connected channel. On success the channel has
    /// encryption and integrity switched per the decided policy and is ready
    /// for the command payload.
    pub async fn start_command(
        &self,
        channel: &mut ReliableChannel,
        request: &CommandRequest,
        errors: &mut ErrorStack,
    ) -> Result<CommandOutcome> {
        channel.arm_deadline(self.config.deadline());
        let result = self.run_stream(channel, request, errors).await;
        channel.clear_deadline();

        if let Err(e) = &result {
            tracing::debug!(
                peer = %request.peer,
                command = request.command,
                error = %e,
                "command start failed"
            );
            errors.push_error(SUBSYSTEM, e);
        }
        result
    }

    /// Ask the peer whether `request` would be authorized, without running
    /// it.
    pub async fn query(
        &self,
        channel: &mut ReliableChannel,
        request: &CommandRequest,
        errors: &mut ErrorStack,
    ) -> Result<bool> {
        let probe = CommandRequest {
            command: DC_SEC_QUERY,
            auth_command: Some(request.command),
            session_hint: None,
            ..request.clone()
        };
        self.start_command(channel, &probe, errors).await?;
        let reply = channel.recv_record().await?;
        Ok(reply
            .get_bool(attr::AUTHORIZATION_SUCCEEDED)
            .unwrap_or(false))
    }

    async fn run_stream(
        &self,
        channel: &mut ReliableChannel,
        request: &CommandRequest,
        errors: &mut ErrorStack,
    ) -> Result<CommandOutcome> {
        let mut n = Negotiation::default();
        let mut state = InitiatorState::SendPolicy;
        loop {
            tracing::trace!(?state, peer = %request.peer, command = request.command, "initiator");
            state = match state {
                InitiatorState::SendPolicy => self.send_policy(channel, request, &mut n).await?,
                InitiatorState::ReceiveDecision => receive_decision(channel, &mut n).await?,
                InitiatorState::Authenticate => self.authenticate(channel, &mut n, errors).await?,
                InitiatorState::ActivateCrypto => activate_crypto(channel, &n)?,
                InitiatorState::ReceiveSessionInfo => {
                    self.receive_session_info(channel, request, &mut n).await?
                }
                InitiatorState::Done => return Ok(n.outcome),
            };
        }
    }

    async fn send_policy(
        &self,
        channel: &mut ReliableChannel,
        request: &CommandRequest,
        n: &mut Negotiation,
    ) -> Result<InitiatorState> {
        if let Some(session) = self
            .sessions
            .resume(&request.peer, request.command, request.session_hint.as_deref())
            .await
        {
            channel.send_command(DC_AUTHENTICATE).await?;
            channel.send_record(&resume_record(&session, request)).await?;
            channel.watch_resumed(session.id.clone(), self.sessions.clone());
            tracing::debug!(
                session_id = %session.id,
                peer = %request.peer,
                command = request.command,
                "resuming session"
            );

            n.key = session.preferred_key().cloned();
            n.outcome = CommandOutcome {
                session_id: Some(session.id.clone()),
                resumed: true,
                negotiated: true,
                remote_user: session
                    .policy
                    .get_str(attr::MY_REMOTE_USER_NAME)
                    .map(String::from),
                remote_version: session.policy.get_str(attr::REMOTE_VERSION).map(String::from),
            };
            n.decided = session.policy;
            return Ok(InitiatorState::ActivateCrypto);
        }

        let declared = self.config.declared_policy(
            request.permission,
            request.policy_request(&self.config),
            self.cipher.as_ref(),
        )?;
        if declared.negotiation.local_decision() == FeatureDecision::No {
            channel.send_command(request.command).await?;
            tracing::debug!(peer = %request.peer, command = request.command, "sent raw command");
            return Ok(InitiatorState::Done);
        }

        let mut record = declared.to_record();
        record.set(attr::COMMAND, request.command);
        if let Some(auth_command) = request.auth_command {
            record.set(attr::AUTH_COMMAND, auth_command);
        }
        n.new_session = request.command != DC_SEC_QUERY;
        if n.new_session {
            record.set(attr::NEW_SESSION, "YES");
        }
        record.set(attr::ENACT, "NO");
        record.set(attr::REMOTE_VERSION, PROTOCOL_VERSION);
        record.set(attr::CONNECT_ADDRESS, request.peer.as_str());
        if let Some(addr) = &request.return_address {
            record.set(attr::SERVER_RETURN_ADDRESS, addr);
        }
        record.set(attr::OWNER_UNIQUE_ID, self.identity.owner_id());
        record.set(attr::SERVER_PROCESS_ID, self.identity.pid());

        channel.send_command(DC_AUTHENTICATE).await?;
        channel.send_record(&record).await?;
        n.policy = record;
        n.outcome.negotiated = true;
        Ok(InitiatorState::ReceiveDecision)
    }

    async fn authenticate(
        &self,
        channel: &mut ReliableChannel,
        n: &mut Negotiation,
        errors: &mut ErrorStack,
    ) -> Result<InitiatorState> {
        if !n.decided.decision(attr::AUTHENTICATION).is_yes() {
            return Ok(InitiatorState::ActivateCrypto);
        }
        let methods = n
            .decided
            .get_list(attr::AUTHENTICATION_METHODS_LIST)
            .or_else(|| n.decided.get_list(attr::AUTHENTICATION_METHODS))
            .unwrap_or_default();
        // absent means required
        let required = n.decided.get_bool(attr::AUTH_REQUIRED).unwrap_or(true);

        let attempt = self.run_authentication(channel, &methods).await;
        channel.set_tried_authentication(true);
        match attempt {
            Ok(outcome) => {
                tracing::debug!(peer = %channel.peer(), method = %outcome.method, "authenticated");
                n.policy.set(attr::AUTHENTICATION_METHODS, outcome.method.as_str());
                n.key = outcome.key;
            }
            Err(e) if required => return Err(e),
            Err(e) => {
                tracing::warn!(peer = %channel.peer(), error = %e, "authentication failed, continuing without it");
                errors.push_error("AUTHENTICATE", &e);
            }
        }
        Ok(InitiatorState::ActivateCrypto)
    }

    async fn run_authentication(
        &self,
        channel: &mut ReliableChannel,
        methods: &[String],
    ) -> Result<AuthOutcome> {
        let authenticator = self.auth.select_initiator(channel, methods).await?;
        let mut handshake = authenticator.initiate(AuthContext::default());
        run_handshake(handshake.as_mut(), channel).await
    }

    async fn receive_session_info(
        &self,
        channel: &mut ReliableChannel,
        request: &CommandRequest,
        n: &mut Negotiation,
    ) -> Result<InitiatorState> {
        let info = channel.recv_record().await?;
        match info.get_str(attr::RETURN_CODE) {
            None | Some("") => {}
            Some(code) => {
                let code = ReturnCode::parse(code).unwrap_or(ReturnCode::Denied);
                if code != ReturnCode::Authorized {
                    return Err(SecManError::AuthorizationDenied {
                        code,
                        message: format!("{} refused command {}", request.peer, request.command),
                    });
                }
            }
        }

        let session_id = require_str(&info, attr::SESSION_ID)?.to_string();
        require_str(&info, attr::VALID_COMMANDS)?;
        n.policy.copy_from(&info, attr::SESSION_ID);
        n.policy.copy_from(&info, attr::VALID_COMMANDS);
        n.policy.copy_as(attr::MY_REMOTE_USER_NAME, &info, attr::USER);
        match channel.identity() {
            Some(user) => n.policy.set(attr::USER, user),
            None => {
                n.policy.remove(attr::USER);
            }
        }
        n.policy.copy_from(&info, attr::TRIED_AUTHENTICATION);

        let seconds = |name: &str| n.policy.get_int(name).unwrap_or(0).max(0) as u64;
        let duration = seconds(attr::SESSION_DURATION);
        let lease = seconds(attr::SESSION_LEASE);
        let now = Instant::now();
        let entry = SessionEntry::new(session_id.clone(), n.policy.clone(), now)
            .bound_to(Some(request.peer.clone()))
            .with_keys(n.key.clone().into_iter().collect())
            .expiring_at((duration > 0).then(|| now + Duration::from_secs(duration)))
            .with_lease(Duration::from_secs(lease));
        self.sessions.insert(entry, Some(&request.peer)).await?;

        tracing::info!(
            session_id = %session_id,
            peer = %request.peer,
            duration,
            lease,
            "session established"
        );
        n.outcome.remote_user = info.get_str(attr::USER).map(String::from);
        n.outcome.session_id = Some(session_id);
        Ok(InitiatorState::Done)
    }

    /// Prepare a datagram command. Reuses a cached session, bootstrapping
    /// one over a stream when needed; commands to this very process carry
    /// the same-process cookie instead.
    pub async fn start_datagram(
        &self,
        request: &CommandRequest,
        errors: &mut ErrorStack,
    ) -> Result<DatagramCommand> {
        let result = self.prepare_datagram(request, errors).await;
        if let Err(e) = &result {
            errors.push_error(SUBSYSTEM, e);
        }
        result
    }

    async fn prepare_datagram(
        &self,
        request: &CommandRequest,
        errors: &mut ErrorStack,
    ) -> Result<DatagramCommand> {
        let mut bootstrapped = false;
        loop {
            let mut writer = DatagramWriter::new(self.cipher.clone());

            if self.identity.is_self(&request.peer) {
                writer.set_cookie(self.identity.cookie());
                writer.push(WireMessage::Command(request.command));
                return Ok(DatagramCommand {
                    writer,
                    session_id: None,
                    bootstrapped,
                });
            }

            if let Some(session) = self
                .sessions
                .resume(&request.peer, request.command, request.session_hint.as_deref())
                .await
            {
                let key_id = format!(
                    "{},{}",
                    session.id,
                    request.return_address.as_deref().unwrap_or_default()
                );
                writer.set_session(
                    &key_id,
                    session.preferred_key().cloned(),
                    session.policy.decision(attr::ENCRYPTION).is_yes(),
                    session.policy.decision(attr::INTEGRITY).is_yes(),
                )?;
                writer.push(WireMessage::Command(DC_AUTHENTICATE));
                writer.push(WireMessage::Record(resume_record(&session, request)));
                return Ok(DatagramCommand {
                    writer,
                    session_id: Some(session.id),
                    bootstrapped,
                });
            }

            let declared = self.config.declared_policy(
                request.permission,
                request.policy_request(&self.config),
                self.cipher.as_ref(),
            )?;
            if bootstrapped || declared.negotiation.local_decision() == FeatureDecision::No {
                if bootstrapped {
                    tracing::warn!(
                        peer = %request.peer,
                        command = request.command,
                        "bootstrapped session does not cover command, sending raw datagram"
                    );
                }
                writer.push(WireMessage::Command(request.command));
                return Ok(DatagramCommand {
                    writer,
                    session_id: None,
                    bootstrapped,
                });
            }

            self.bootstrap(request, errors).await?;
            bootstrapped = true;
        }
    }

    /// Create the session a datagram needs, or wait for whoever is already
    /// creating it.
    async fn bootstrap(&self, request: &CommandRequest, errors: &mut ErrorStack) -> Result<()> {
        let key = session_key(&request.peer, request.command);
        let guard = match self.sessions.bootstraps().begin(&key) {
            BootstrapTicket::Owner(guard) => guard,
            BootstrapTicket::Waiter(waiter) => {
                tracing::debug!(key = %key, position = waiter.position(), "queued behind bootstrap");
                return match waiter.wait().await {
                    BootstrapOutcome::Established { .. } => Ok(()),
                    BootstrapOutcome::Failed { reason } => Err(SecManError::SessionNotFound(
                        format!("bootstrap of {key} failed: {reason}"),
                    )),
                };
            }
        };

        // an earlier owner may have finished between our cache miss and begin
        if let Some(session) = self
            .sessions
            .resume(&request.peer, request.command, None)
            .await
        {
            guard.resolve(BootstrapOutcome::Established {
                session_id: session.id,
            });
            return Ok(());
        }

        match self.run_bootstrap(request, errors).await {
            Ok(session_id) => {
                let woken = guard.resolve(BootstrapOutcome::Established { session_id });
                tracing::debug!(key = %key, woken, "bootstrap finished");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "bootstrap failed");
                guard.resolve(BootstrapOutcome::Failed {
                    reason: e.to_string(),
                });
                Err(SecManError::SessionNotFound(format!(
                    "bootstrap of {key} failed: {e}"
                )))
            }
        }
    }

    async fn run_bootstrap(
        &self,
        request: &CommandRequest,
        errors: &mut ErrorStack,
    ) -> Result<String> {
        let stream = self
            .connector
            .connect(&request.peer, self.config.connect_timeout())
            .await?;
        let mut channel = ReliableChannel::new(stream, request.peer.clone(), self.cipher.clone());

        let establish = CommandRequest {
            command: DC_AUTHENTICATE,
            auth_command: Some(request.command),
            session_hint: None,
            ..request.clone()
        };
        let result = self.start_command(&mut channel, &establish, errors).await;
        if let Err(e) = channel.close().await {
            tracing::debug!(peer = %request.peer, error = %e, "closing bootstrap connection");
        }

        result?.session_id.ok_or_else(|| {
            SecManError::SessionNotFound(format!("{} created no session", request.peer))
        })
    }
}

/// The short record that resumes a cached session
fn resume_record(session: &CachedSession, request: &CommandRequest) -> NegotiationRecord {
    let mut record = session.policy.project(&RESUME_ATTRS);
    record.set(attr::USE_SESSION, "YES");
    record.set(attr::SESSION_ID, session.id.as_str());
    record.set(attr::COMMAND, request.command);
    match request.auth_command {
        Some(command) => record.set(attr::AUTH_COMMAND, command),
        None => {
            record.remove(attr::AUTH_COMMAND);
        }
    }
    record.set(attr::CONNECT_ADDRESS, request.peer.as_str());
    if let Some(addr) = &request.return_address {
        record.set(attr::SERVER_RETURN_ADDRESS, addr);
    }
    record
}

async fn receive_decision(
    channel: &mut ReliableChannel,
    n: &mut Negotiation,
) -> Result<InitiatorState> {
    let reply = channel.recv_record().await?;
    if let Some(code) = reply.return_code().filter(|c| *c != ReturnCode::Authorized) {
        let reason = reply.get_str(attr::REASON).unwrap_or("no reason given");
        return Err(SecManError::PolicyConflict(format!(
            "{} answered {code}: {reason}",
            channel.peer()
        )));
    }

    for name in LOCAL_ONLY_ATTRS {
        n.policy.remove(name);
    }
    for name in DECIDED_ATTRS {
        n.policy.copy_from(&reply, name);
    }
    n.policy.remove(attr::NEW_SESSION);
    n.policy.set(attr::USE_SESSION, "YES");

    tracing::debug!(
        peer = %channel.peer(),
        authentication = %reply.decision(attr::AUTHENTICATION),
        encryption = %reply.decision(attr::ENCRYPTION),
        integrity = %reply.decision(attr::INTEGRITY),
        "policy decided"
    );
    n.outcome.remote_version = reply.get_str(attr::REMOTE_VERSION).map(String::from);
    n.decided = reply;
    Ok(InitiatorState::Authenticate)
}

/// Switch protection on exactly when decided; the key stays installed
/// either way.
fn activate_crypto(channel: &mut ReliableChannel, n: &Negotiation) -> Result<InitiatorState> {
    let encrypt = n.decided.decision(attr::ENCRYPTION).is_yes();
    let integrity = n.decided.decision(attr::INTEGRITY).is_yes();
    channel.set_crypto_key(encrypt, n.key.clone())?;
    channel.set_integrity(integrity, n.key.clone())?;

    Ok(if n.outcome.resumed || !n.new_session {
        InitiatorState::Done
    } else {
        InitiatorState::ReceiveSessionInfo
    })
}
