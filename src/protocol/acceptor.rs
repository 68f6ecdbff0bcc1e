//! Command acceptor: the listening side of a command.
//!
//! Stream commands run a small state machine; datagram commands are
//! checked against a cached session (or the same-process cookie) and
//! dispatched in one pass.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::policy::{Feature, RequirementLevel, SecurityPolicy};
use super::reconcile::{reconcile, DecidedPolicy};
use super::record::{attr, NegotiationRecord, ReturnCode};
use super::{DC_AUTHENTICATE, DC_INVALIDATE_KEY, DC_SEC_QUERY, PROTOCOL_VERSION};
use crate::auth::{AuthContext, AuthHandshake, AuthRegistry, AuthStep};
use crate::config::{Permission, PolicyRequest, SecurityConfig};
use crate::crypto::{ChaChaCipher, CipherCapability, SessionKey};
use crate::error::{ErrorStack, Result, SecManError};
use crate::server::{
    AllowList, AuthorizationPolicy, CommandContext, CommandIo, CommandTable, ProcessIdentity,
    SelfIdentity, LOCAL_IDENTITY,
};
use crate::session::{CachedSession, SessionEntry, SessionService};
use crate::transport::{DatagramPacket, DatagramReader, DatagramWriter, ReliableChannel, WireMessage};

const SUBSYSTEM: &str = "SECMAN";

/// Attributes copied from the initiator's declared record into the cached
/// session
const DECLARED_ATTRS: [&str; 4] = [
    attr::SERVER_RETURN_ADDRESS,
    attr::OWNER_UNIQUE_ID,
    attr::SERVER_PROCESS_ID,
    attr::REMOTE_VERSION,
];

/// How an incoming command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptOutcome {
    /// Command authorized and dispatched
    Completed {
        /// Command number
        command: u32,
        /// Session the command ran under
        session_id: Option<String>,
        /// Peer identity
        identity: Option<String>,
        /// Whether a session was created for it
        new_session: bool,
    },
    /// Command refused
    Rejected {
        /// Command number (0 when unknown)
        command: u32,
        /// Refusal class
        code: ReturnCode,
        /// Human readable reason
        reason: String,
    },
    /// Datagram or stream resume named a session we do not hold; the
    /// notice should go back to the sender
    SessionNotFound(SessionNotFoundNotice),
    /// Peer told us it lost a session
    Invalidated {
        /// Session the notice named
        session_id: Option<String>,
        /// Whether we held it
        removed: bool,
    },
}

/// Tells a datagram sender that its session is unknown here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionNotFoundNotice {
    /// Session the sender used
    pub session_id: String,
    /// Where the sender asked notices to go
    pub return_address: Option<String>,
}

impl SessionNotFoundNotice {
    /// Notice body
    pub fn to_record(&self) -> NegotiationRecord {
        let mut record = NegotiationRecord::new();
        record.set(attr::SESSION_ID, self.session_id.as_str());
        record.set(attr::RETURN_CODE, ReturnCode::SidNotFound.as_str());
        record
    }

    /// Unprotected datagram carrying the notice
    pub fn to_packet(&self, cipher: Arc<dyn CipherCapability>) -> Result<DatagramPacket> {
        let mut writer = DatagramWriter::new(cipher);
        writer.push(WireMessage::Command(DC_INVALIDATE_KEY));
        writer.push(WireMessage::Record(self.to_record()));
        writer.finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptorState {
    ReadHeader,
    ReadCommand,
    Authenticate,
    AuthenticateContinue,
    ActivateCrypto,
    VerifyCommand,
    SendResponse,
    Dispatch,
}

enum Step {
    Next(AcceptorState),
    Finish(AcceptOutcome),
}

/// Everything learned about one incoming stream command.
#[derive(Default)]
struct Inbound {
    command: u32,
    auth_command: Option<u32>,
    declared: NegotiationRecord,
    session: Option<CachedSession>,
    decided: Option<DecidedPolicy>,
    new_session_id: Option<String>,
    key: Option<SessionKey>,
    handshake: Option<Box<dyn AuthHandshake>>,
    negotiated: bool,
    permission: Option<Permission>,
    refusal: Option<SecManError>,
}

impl Inbound {
    /// Command whose permission applies
    fn effective_command(&self) -> u32 {
        effective_command(self.command, self.auth_command)
    }

    fn protection(&self) -> (bool, bool) {
        match (&self.decided, &self.session) {
            (Some(decided), _) => (
                decided.decision(Feature::Encryption).is_yes(),
                decided.decision(Feature::Integrity).is_yes(),
            ),
            (None, Some(session)) => (
                session.policy.decision(attr::ENCRYPTION).is_yes(),
                session.policy.decision(attr::INTEGRITY).is_yes(),
            ),
            (None, None) => (false, false),
        }
    }

    fn session_id(&self) -> Option<String> {
        self.new_session_id
            .clone()
            .or_else(|| self.session.as_ref().map(|s| s.id.clone()))
    }
}

fn effective_command(command: u32, auth_command: Option<u32>) -> u32 {
    match command {
        DC_AUTHENTICATE | DC_SEC_QUERY => auth_command.unwrap_or(command),
        _ => command,
    }
}

fn is_builtin(command: u32) -> bool {
    matches!(command, DC_AUTHENTICATE | DC_SEC_QUERY)
}

fn command_attr(record: &NegotiationRecord, name: &str) -> Option<u32> {
    record.get_int(name).and_then(|v| u32::try_from(v).ok())
}

fn next_record(messages: &mut VecDeque<WireMessage>) -> Result<NegotiationRecord> {
    messages
        .pop_front()
        .ok_or_else(|| SecManError::Protocol("datagram ended before its record".into()))?
        .into_record()
}

/// Who is asking, as far as authorization is concerned.
struct Requester<'a> {
    command: u32,
    auth_command: Option<u32>,
    peer: &'a str,
    identity: Option<&'a str>,
    trusted: bool,
    negotiated: bool,
}

/// Accepts commands on behalf of this process.
#[derive(Debug, Clone)]
pub struct CommandAcceptor {
    config: Arc<SecurityConfig>,
    sessions: Arc<SessionService>,
    commands: Arc<CommandTable>,
    auth: Arc<AuthRegistry>,
    authz: Arc<dyn AuthorizationPolicy>,
    cipher: Arc<dyn CipherCapability>,
    identity: Arc<dyn SelfIdentity>,
}

impl CommandAcceptor {
    /// Acceptor authorizing from the config's authorization table
    pub fn new(
        config: Arc<SecurityConfig>,
        sessions: Arc<SessionService>,
        commands: Arc<CommandTable>,
    ) -> Self {
        let authz = Arc::new(AllowList::from_config(&config));
        Self {
            config,
            sessions,
            commands,
            auth: Arc::new(AuthRegistry::with_defaults()),
            authz,
            cipher: Arc::new(ChaChaCipher::new()),
            identity: Arc::new(ProcessIdentity::new()),
        }
    }

    /// Replace the authenticators
    pub fn with_auth(mut self, auth: Arc<AuthRegistry>) -> Self {
        self.auth = auth;
        self
    }

    /// Replace the authorization policy
    pub fn with_authz(mut self, authz: Arc<dyn AuthorizationPolicy>) -> Self {
        self.authz = authz;
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

    /// Cipher capability
    pub fn cipher(&self) -> &Arc<dyn CipherCapability> {
        &self.cipher
    }

    /// Shared session service
    pub fn sessions(&self) -> &Arc<SessionService> {
        &self.sessions
    }

    /// Registered commands
    pub fn commands(&self) -> &Arc<CommandTable> {
        &self.commands
    }

    /// Run one command arriving on `channel`, from the first message to
    /// the end of its handler.
    pub async fn accept_stream(
        &self,
        channel: &mut ReliableChannel,
        errors: &mut ErrorStack,
    ) -> Result<AcceptOutcome> {
        channel.arm_deadline(self.config.deadline());
        let result = self.run_stream(channel, errors).await;
        channel.clear_deadline();

        if let Err(e) = &result {
            errors.push_error(SUBSYSTEM, e);
        }
        result
    }

    async fn run_stream(
        &self,
        channel: &mut ReliableChannel,
        errors: &mut ErrorStack,
    ) -> Result<AcceptOutcome> {
        let mut inbound = Inbound::default();
        let mut state = AcceptorState::ReadHeader;
        loop {
            tracing::trace!(?state, peer = %channel.peer(), "acceptor");
            let step = match state {
                AcceptorState::ReadHeader => read_header(channel, &mut inbound).await?,
                AcceptorState::ReadCommand => {
                    self.read_command(channel, &mut inbound, errors).await?
                }
                AcceptorState::Authenticate => {
                    self.authenticate(channel, &mut inbound, errors).await?
                }
                AcceptorState::AuthenticateContinue => {
                    authenticate_continue(channel, &mut inbound, errors).await?
                }
                AcceptorState::ActivateCrypto => {
                    let (encrypt, integrity) = inbound.protection();
                    channel.set_crypto_key(encrypt, inbound.key.clone())?;
                    channel.set_integrity(integrity, inbound.key.clone())?;
                    Step::Next(AcceptorState::VerifyCommand)
                }
                AcceptorState::VerifyCommand => self.verify_command(channel, &mut inbound),
                AcceptorState::SendResponse => self.send_response(channel, &mut inbound).await?,
                AcceptorState::Dispatch => self.dispatch(channel, &mut inbound).await?,
            };
            state = match step {
                Step::Next(next) => next,
                Step::Finish(outcome) => {
                    match &outcome {
                        AcceptOutcome::Rejected { command, code, reason } => tracing::info!(
                            peer = %channel.peer(),
                            command,
                            %code,
                            reason = %reason,
                            "command rejected"
                        ),
                        AcceptOutcome::SessionNotFound(notice) => tracing::info!(
                            peer = %channel.peer(),
                            session_id = %notice.session_id,
                            "resume of unknown session"
                        ),
                        _ => {}
                    }
                    return Ok(outcome);
                }
            };
        }
    }

    async fn read_command(
        &self,
        channel: &mut ReliableChannel,
        inbound: &mut Inbound,
        errors: &mut ErrorStack,
    ) -> Result<Step> {
        let declared = channel.recv_record().await?;
        inbound.command = command_attr(&declared, attr::COMMAND)
            .ok_or_else(|| SecManError::Protocol("missing attribute Command".into()))?;
        inbound.auth_command = command_attr(&declared, attr::AUTH_COMMAND);
        inbound.negotiated = true;

        if declared.get_bool(attr::USE_SESSION) == Some(true) {
            let id = declared.get_str(attr::SESSION_ID).unwrap_or_default();
            let Some(session) = self.sessions.resume_by_id(id).await else {
                let notice = SessionNotFoundNotice {
                    session_id: id.to_string(),
                    return_address: declared
                        .get_str(attr::SERVER_RETURN_ADDRESS)
                        .map(String::from),
                };
                channel.send_record(&notice.to_record()).await?;
                return Ok(Step::Finish(AcceptOutcome::SessionNotFound(notice)));
            };

            tracing::debug!(session_id = %session.id, peer = %channel.peer(), "session resumed");
            let user = session.policy.get_str(attr::USER).map(String::from);
            let method = session
                .policy
                .get_str(attr::AUTHENTICATION_METHODS)
                .unwrap_or_default()
                .to_string();
            if user.is_some() {
                channel.set_authenticated(user, method);
            }
            channel.set_tried_authentication(
                session
                    .policy
                    .get_bool(attr::TRIED_AUTHENTICATION)
                    .unwrap_or(false),
            );
            inbound.key = session.preferred_key().cloned();
            inbound.session = Some(session);
            inbound.declared = declared;
            return Ok(Step::Next(AcceptorState::ActivateCrypto));
        }

        let theirs = SecurityPolicy::from_record(&declared)?;
        let effective = inbound.effective_command();
        let ours = self.declared_policy(effective)?;

        let decided = match reconcile(&theirs, &ours) {
            Ok(decided) => decided,
            Err(e) => {
                let reason = e.to_string();
                errors.push_error(SUBSYSTEM, &SecManError::PolicyConflict(reason.clone()));
                if declared.get_bool(attr::ENACT) != Some(true) {
                    let mut reply = NegotiationRecord::new();
                    reply.set(attr::RETURN_CODE, ReturnCode::Denied.as_str());
                    reply.set(attr::REASON, reason.as_str());
                    channel.send_record(&reply).await?;
                }
                return Ok(Step::Finish(AcceptOutcome::Rejected {
                    command: inbound.command,
                    code: ReturnCode::Denied,
                    reason,
                }));
            }
        };

        let new_session = declared.get_bool(attr::NEW_SESSION) == Some(true);
        if new_session {
            inbound.new_session_id =
                Some(format!("{}:{}", self.identity.pid(), uuid::Uuid::new_v4()));
        }
        // the key rides on authentication; a query needs one as soon as the
        // channel itself is protected
        let protected = decided.encryption.is_yes() || decided.integrity.is_yes();
        if decided.authentication.is_yes() && (new_session || protected) {
            inbound.key = decided
                .primary_crypto_method()
                .map(|method| self.cipher.generate_key(method))
                .transpose()?;
        }

        if declared.get_bool(attr::ENACT) != Some(true) {
            let mut reply = decided.to_record();
            reply.set(attr::REMOTE_VERSION, PROTOCOL_VERSION);
            channel.send_record(&reply).await?;
        }

        tracing::debug!(
            peer = %channel.peer(),
            command = inbound.command,
            authentication = %decided.authentication,
            encryption = %decided.encryption,
            integrity = %decided.integrity,
            "policy decided"
        );
        inbound.decided = Some(decided);
        inbound.declared = declared;
        Ok(Step::Next(AcceptorState::Authenticate))
    }

    async fn authenticate(
        &self,
        channel: &mut ReliableChannel,
        inbound: &mut Inbound,
        errors: &mut ErrorStack,
    ) -> Result<Step> {
        let methods = match &inbound.decided {
            Some(decided) if decided.authentication.is_yes() => decided.auth_methods.clone(),
            _ => return Ok(Step::Next(AcceptorState::ActivateCrypto)),
        };

        match self.auth.select_acceptor(channel, &methods).await {
            Ok(authenticator) => {
                inbound.handshake = Some(authenticator.accept(AuthContext {
                    session_key: inbound.key.clone(),
                }));
                Ok(Step::Next(AcceptorState::AuthenticateContinue))
            }
            Err(e) => authentication_failed(channel, inbound, e, errors),
        }
    }

    fn declared_policy(&self, effective: u32) -> Result<SecurityPolicy> {
        let forced = self.config.is_forced_auth(effective)
            || self
                .commands
                .get(effective)
                .is_some_and(|entry| entry.force_authentication);
        self.config.declared_policy(
            self.commands
                .permission_of(effective)
                .unwrap_or(Permission::Allow),
            PolicyRequest {
                force_authentication: forced,
                ..PolicyRequest::default()
            },
            self.cipher.as_ref(),
        )
    }

    /// Decide whether `requester` may run its command. Refusals come back
    /// as [`SecManError::AuthorizationDenied`].
    fn authorize(&self, requester: &Requester<'_>) -> Result<Permission> {
        let denied = |code: ReturnCode, message: String| SecManError::AuthorizationDenied { code, message };
        let effective = effective_command(requester.command, requester.auth_command);

        let entry = self.commands.get(effective);
        if entry.is_none() && !is_builtin(requester.command) {
            return Err(denied(
                ReturnCode::CmdNotFound,
                format!("command {} is not registered", requester.command),
            ));
        }
        let permission = entry.map_or(Permission::Allow, |e| e.permission);
        if permission == Permission::Allow || requester.trusted {
            return Ok(permission);
        }

        if requester.identity.is_none() {
            let ours = self.declared_policy(effective)?;
            let forced = self.config.is_forced_auth(effective)
                || entry.is_some_and(|e| e.force_authentication);
            let required = |level: RequirementLevel| level == RequirementLevel::Required;
            let demands_auth = forced
                || required(ours.authentication)
                || required(ours.encryption)
                || required(ours.integrity)
                || (!requester.negotiated && required(ours.negotiation));
            if demands_auth {
                return Err(denied(
                    ReturnCode::Denied,
                    format!("command {effective} requires an authenticated peer"),
                ));
            }
        }

        if !self
            .authz
            .verify(requester.identity, permission, requester.peer)
        {
            return Err(denied(
                ReturnCode::Denied,
                format!(
                    "{} from {} lacks {permission} for command {effective}",
                    requester.identity.unwrap_or("unauthenticated peer"),
                    requester.peer
                ),
            ));
        }
        Ok(permission)
    }

    fn verify_command(&self, channel: &ReliableChannel, inbound: &mut Inbound) -> Step {
        let requester = Requester {
            command: inbound.command,
            auth_command: inbound.auth_command,
            peer: channel.peer(),
            identity: channel.identity(),
            trusted: false,
            negotiated: inbound.negotiated,
        };
        match self.authorize(&requester) {
            Ok(permission) => inbound.permission = Some(permission),
            Err(e) => inbound.refusal = Some(e),
        }

        if inbound.new_session_id.is_some() {
            return Step::Next(AcceptorState::SendResponse);
        }
        match &inbound.refusal {
            Some(refusal) if inbound.command != DC_SEC_QUERY => {
                Step::Finish(rejection(inbound.command, refusal))
            }
            _ => Step::Next(AcceptorState::Dispatch),
        }
    }

    /// Commands a peer may run under a new session
    fn valid_commands(&self, identity: Option<&str>, peer: &str) -> Vec<String> {
        self.commands.authorized_commands(|permission| {
            permission == Permission::Allow || self.authz.verify(identity, permission, peer)
        })
    }

    async fn send_response(
        &self,
        channel: &mut ReliableChannel,
        inbound: &mut Inbound,
    ) -> Result<Step> {
        let session_id = inbound.new_session_id.clone().unwrap_or_default();
        let user = channel.identity().map(String::from);
        let valid = self.valid_commands(user.as_deref(), channel.peer());
        let code = match &inbound.refusal {
            None => ReturnCode::Authorized,
            Some(SecManError::AuthorizationDenied { code, .. }) => *code,
            Some(_) => ReturnCode::Denied,
        };

        let mut info = NegotiationRecord::new();
        if let Some(user) = &user {
            info.set(attr::USER, user);
        }
        info.set(attr::TRIED_AUTHENTICATION, channel.tried_authentication());
        info.set(attr::SESSION_ID, session_id.as_str());
        info.set_list(attr::VALID_COMMANDS, &valid);
        info.set(attr::RETURN_CODE, code.as_str());

        if let Some(refusal) = &inbound.refusal {
            channel.send_record(&info).await?;
            return Ok(if inbound.command == DC_SEC_QUERY {
                Step::Next(AcceptorState::Dispatch)
            } else {
                Step::Finish(rejection(inbound.command, refusal))
            });
        }

        // cached before the reply so a datagram sent right after it finds the session
        if let Some(decided) = &inbound.decided {
            let mut policy = decided.to_record();
            for name in DECLARED_ATTRS {
                policy.copy_from(&inbound.declared, name);
            }
            if let Some(user) = &user {
                policy.set(attr::USER, user);
            }
            if let Some(method) = channel.auth_method() {
                policy.set(attr::AUTHENTICATION_METHODS, method);
            }
            policy.set(attr::TRIED_AUTHENTICATION, channel.tried_authentication());
            policy.set(attr::SESSION_ID, session_id.as_str());
            policy.set_list(attr::VALID_COMMANDS, &valid);
            policy.set(attr::USE_SESSION, "YES");

            let now = Instant::now();
            let slop = self.config.slop();
            let duration = decided.session_duration_secs;
            let lease = decided.session_lease_secs;
            // the stream's source port is ephemeral; the return address is
            // what the peer answers on
            let bound = inbound
                .declared
                .get_str(attr::SERVER_RETURN_ADDRESS)
                .map(String::from);
            let entry = SessionEntry::new(session_id.clone(), policy, now)
                .bound_to(bound)
                .with_keys(inbound.key.clone().into_iter().collect())
                .expiring_at((duration > 0).then(|| now + Duration::from_secs(duration) + slop))
                .with_lease(if lease > 0 {
                    Duration::from_secs(lease) + slop
                } else {
                    Duration::ZERO
                });
            self.sessions.insert(entry, None).await?;

            tracing::info!(
                session_id = %session_id,
                peer = %channel.peer(),
                user = user.as_deref().unwrap_or("-"),
                duration,
                lease,
                "session created"
            );
        }

        channel.send_record(&info).await?;
        Ok(Step::Next(AcceptorState::Dispatch))
    }

    async fn dispatch(&self, channel: &mut ReliableChannel, inbound: &mut Inbound) -> Result<Step> {
        let session_id = inbound.session_id();
        let identity = channel.identity().map(String::from);

        match inbound.command {
            DC_AUTHENTICATE => {}
            DC_SEC_QUERY => {
                let mut reply = NegotiationRecord::new();
                reply.set(attr::AUTHORIZATION_SUCCEEDED, inbound.refusal.is_none());
                if let Some(refusal) = &inbound.refusal {
                    reply.set(attr::REASON, refusal.to_string());
                }
                channel.send_record(&reply).await?;
                if let Some(refusal) = &inbound.refusal {
                    return Ok(Step::Finish(rejection(inbound.command, refusal)));
                }
            }
            command => {
                let entry = self.commands.get(command).ok_or_else(|| {
                    SecManError::Protocol(format!("command {command} vanished from the table"))
                })?;
                let ctx = CommandContext {
                    command,
                    peer: channel.peer().to_string(),
                    identity: identity.clone(),
                    permission: inbound.permission.unwrap_or(entry.permission),
                    session_id: session_id.clone(),
                };
                entry.handler.handle(ctx, CommandIo::Stream(channel)).await?;
            }
        }

        Ok(Step::Finish(AcceptOutcome::Completed {
            command: inbound.command,
            session_id,
            identity,
            new_session: inbound.new_session_id.is_some(),
        }))
    }

    /// Run one command that arrived as a datagram from `from`.
    pub async fn accept_datagram(
        &self,
        packet: &DatagramPacket,
        from: &str,
        errors: &mut ErrorStack,
    ) -> Result<AcceptOutcome> {
        let result = self.run_datagram(packet, from).await;
        if let Err(e) = &result {
            errors.push_error(SUBSYSTEM, e);
        }
        result
    }

    async fn run_datagram(&self, packet: &DatagramPacket, from: &str) -> Result<AcceptOutcome> {
        let reader = DatagramReader::new(self.cipher.clone());
        let header = &packet.header;

        let (messages, identity, session_id, trusted) = if let Some(cookie) = header.cookie.as_deref() {
            if !self.identity.verify_cookie(cookie) {
                tracing::warn!(%from, "datagram carries a foreign cookie");
                return Ok(AcceptOutcome::Rejected {
                    command: 0,
                    code: ReturnCode::Denied,
                    reason: "invalid process cookie".into(),
                });
            }
            (
                reader.open(packet, None)?,
                Some(LOCAL_IDENTITY.to_string()),
                None,
                true,
            )
        } else if let Some(id) = header.session_id() {
            let Some(session) = self.sessions.resume_by_id(id).await else {
                tracing::info!(session_id = id, %from, "datagram for unknown session");
                return Ok(AcceptOutcome::SessionNotFound(SessionNotFoundNotice {
                    session_id: id.to_string(),
                    return_address: header.return_address().map(String::from),
                }));
            };
            let protected = session.policy.decision(attr::ENCRYPTION).is_yes()
                || session.policy.decision(attr::INTEGRITY).is_yes();
            if protected && !(header.sealed || header.signed) {
                return Err(SecManError::Protocol(format!(
                    "unprotected datagram on protected session {id}"
                )));
            }
            (
                reader.open(packet, session.preferred_key())?,
                session.policy.get_str(attr::USER).map(String::from),
                Some(session.id),
                false,
            )
        } else {
            (reader.open(packet, None)?, None, None, false)
        };

        let mut messages = VecDeque::from(messages);
        let first = messages
            .pop_front()
            .ok_or_else(|| SecManError::Protocol("empty datagram".into()))?
            .into_command()?;

        let (command, auth_command) = match first {
            DC_INVALIDATE_KEY => {
                let notice = next_record(&mut messages)?;
                let removed = self.sessions.handle_invalidate_notice(&notice).await;
                return Ok(AcceptOutcome::Invalidated {
                    session_id: notice.get_str(attr::SESSION_ID).map(String::from),
                    removed,
                });
            }
            DC_AUTHENTICATE => {
                let record = next_record(&mut messages)?;
                if let (Some(ours), Some(theirs)) =
                    (session_id.as_deref(), record.get_str(attr::SESSION_ID))
                {
                    if ours != theirs {
                        return Err(SecManError::Protocol(format!(
                            "datagram header names session {ours} but record names {theirs}"
                        )));
                    }
                }
                let command = command_attr(&record, attr::COMMAND)
                    .ok_or_else(|| SecManError::Protocol("missing attribute Command".into()))?;
                (command, command_attr(&record, attr::AUTH_COMMAND))
            }
            command => (command, None),
        };

        let requester = Requester {
            command,
            auth_command,
            peer: from,
            identity: identity.as_deref(),
            trusted,
            negotiated: trusted || session_id.is_some(),
        };
        let permission = match self.authorize(&requester) {
            Ok(permission) => permission,
            Err(e @ SecManError::AuthorizationDenied { .. }) => {
                let outcome = rejection(command, &e);
                tracing::info!(%from, command, error = %e, "datagram command rejected");
                return Ok(outcome);
            }
            Err(e) => return Err(e),
        };

        match command {
            DC_AUTHENTICATE | DC_SEC_QUERY => {
                tracing::debug!(%from, command, "built-in command needs a stream, ignored");
            }
            _ => {
                if let Some(entry) = self.commands.get(command) {
                    let ctx = CommandContext {
                        command,
                        peer: from.to_string(),
                        identity: identity.clone(),
                        permission,
                        session_id: session_id.clone(),
                    };
                    entry
                        .handler
                        .handle(ctx, CommandIo::Datagram(messages))
                        .await?;
                }
            }
        }

        Ok(AcceptOutcome::Completed {
            command,
            session_id,
            identity,
            new_session: false,
        })
    }
}

async fn read_header(channel: &mut ReliableChannel, inbound: &mut Inbound) -> Result<Step> {
    let command = channel.recv_command().await?;
    if command == DC_AUTHENTICATE {
        return Ok(Step::Next(AcceptorState::ReadCommand));
    }
    tracing::debug!(peer = %channel.peer(), command, "raw command");
    inbound.command = command;
    Ok(Step::Next(AcceptorState::VerifyCommand))
}

async fn authenticate_continue(
    channel: &mut ReliableChannel,
    inbound: &mut Inbound,
    errors: &mut ErrorStack,
) -> Result<Step> {
    let Some(handshake) = inbound.handshake.as_mut() else {
        return Ok(Step::Next(AcceptorState::ActivateCrypto));
    };
    match handshake.resume(channel).await {
        Ok(AuthStep::Pending) => Ok(Step::Next(AcceptorState::AuthenticateContinue)),
        Ok(AuthStep::Complete(outcome)) => {
            inbound.handshake = None;
            tracing::debug!(
                peer = %channel.peer(),
                method = %outcome.method,
                identity = outcome.identity.as_deref().unwrap_or("-"),
                "peer authenticated"
            );
            channel.set_authenticated(outcome.identity, outcome.method);
            inbound.key = outcome.key;
            Ok(Step::Next(AcceptorState::ActivateCrypto))
        }
        Err(e) => {
            inbound.handshake = None;
            authentication_failed(channel, inbound, e, errors)
        }
    }
}

fn authentication_failed(
    channel: &mut ReliableChannel,
    inbound: &mut Inbound,
    err: SecManError,
    errors: &mut ErrorStack,
) -> Result<Step> {
    channel.set_tried_authentication(true);
    errors.push_error("AUTHENTICATE", &err);
    let required = inbound.decided.as_ref().map_or(true, |d| d.auth_required);
    if required {
        return Err(err);
    }
    tracing::warn!(peer = %channel.peer(), error = %err, "authentication failed, continuing without it");
    inbound.key = None;
    Ok(Step::Next(AcceptorState::ActivateCrypto))
}

fn rejection(command: u32, refusal: &SecManError) -> AcceptOutcome {
    match refusal {
        SecManError::AuthorizationDenied { code, message } => AcceptOutcome::Rejected {
            command,
            code: *code,
            reason: message.clone(),
        },
        other => AcceptOutcome::Rejected {
            command,
            code: ReturnCode::Denied,
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::EchoHandler;

    fn acceptor(config: SecurityConfig) -> CommandAcceptor {
        let mut table = CommandTable::new();
        table
            .register(421, "QUERY", Permission::Read, Arc::new(EchoHandler))
            .register(422, "UPDATE", Permission::Write, Arc::new(EchoHandler));
        CommandAcceptor::new(
            Arc::new(config),
            Arc::new(SessionService::new()),
            Arc::new(table),
        )
    }

    fn pair() -> (ReliableChannel, ReliableChannel) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let cipher: Arc<dyn CipherCapability> = Arc::new(ChaChaCipher::new());
        (
            ReliableChannel::new(a, "10.0.0.7:4000", cipher.clone()),
            ReliableChannel::new(b, "server", cipher),
        )
    }

    #[tokio::test]
    async fn test_raw_unknown_command() {
        let acceptor = acceptor(SecurityConfig::default());
        let (mut server, mut client) = pair();
        client.send_command(999).await.unwrap();

        let mut errors = ErrorStack::new();
        let outcome = acceptor.accept_stream(&mut server, &mut errors).await.unwrap();
        assert!(matches!(
            outcome,
            AcceptOutcome::Rejected { command: 999, code: ReturnCode::CmdNotFound, .. }
        ));
        assert!(!server.has_deadline());
    }

    #[tokio::test]
    async fn test_raw_command_dispatched() {
        let acceptor = acceptor(SecurityConfig::default());
        let (mut server, mut client) = pair();
        client.send_command(421).await.unwrap();
        client.send(&WireMessage::data(b"hello")).await.unwrap();

        let mut errors = ErrorStack::new();
        let outcome = acceptor.accept_stream(&mut server, &mut errors).await.unwrap();
        assert_eq!(
            outcome,
            AcceptOutcome::Completed {
                command: 421,
                session_id: None,
                identity: None,
                new_session: false,
            }
        );
        assert_eq!(client.recv().await.unwrap().into_data().unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_raw_refused_when_negotiation_required() {
        let mut config = SecurityConfig::default();
        config.default.negotiation = RequirementLevel::Required;
        let acceptor = acceptor(config);
        let (mut server, mut client) = pair();
        client.send_command(421).await.unwrap();

        let mut errors = ErrorStack::new();
        let outcome = acceptor.accept_stream(&mut server, &mut errors).await.unwrap();
        assert!(matches!(
            outcome,
            AcceptOutcome::Rejected { code: ReturnCode::Denied, .. }
        ));
    }

    #[tokio::test]
    async fn test_resume_unknown_session() {
        let acceptor = acceptor(SecurityConfig::default());
        let (mut server, mut client) = pair();
        let mut record = NegotiationRecord::new();
        record.set(attr::USE_SESSION, "YES");
        record.set(attr::SESSION_ID, "gone");
        record.set(attr::COMMAND, 421u32);
        record.set(attr::SERVER_RETURN_ADDRESS, "127.0.0.1:7000");
        client.send_command(DC_AUTHENTICATE).await.unwrap();
        client.send_record(&record).await.unwrap();

        let mut errors = ErrorStack::new();
        let outcome = acceptor.accept_stream(&mut server, &mut errors).await.unwrap();
        assert_eq!(
            outcome,
            AcceptOutcome::SessionNotFound(SessionNotFoundNotice {
                session_id: "gone".into(),
                return_address: Some("127.0.0.1:7000".into()),
            })
        );

        let reply = client.recv_record().await.unwrap();
        assert_eq!(reply.return_code(), Some(ReturnCode::SidNotFound));
        assert_eq!(reply.get_str(attr::SESSION_ID), Some("gone"));
    }

    #[tokio::test]
    async fn test_conflict_answers_denied() {
        let mut config = SecurityConfig::default();
        config.default.authentication = RequirementLevel::Required;
        let acceptor = acceptor(config);
        let (mut server, mut client) = pair();

        let mut declared = SecurityPolicy {
            authentication: RequirementLevel::Never,
            encryption: RequirementLevel::Never,
            integrity: RequirementLevel::Never,
            ..SecurityPolicy::default()
        }
        .to_record();
        declared.set(attr::COMMAND, 421u32);
        declared.set(attr::NEW_SESSION, "YES");
        client.send_command(DC_AUTHENTICATE).await.unwrap();
        client.send_record(&declared).await.unwrap();

        let mut errors = ErrorStack::new();
        let outcome = acceptor.accept_stream(&mut server, &mut errors).await.unwrap();
        assert!(matches!(
            outcome,
            AcceptOutcome::Rejected { code: ReturnCode::Denied, .. }
        ));
        assert!(errors.has_code("POLICY_CONFLICT"));

        let reply = client.recv_record().await.unwrap();
        assert_eq!(reply.return_code(), Some(ReturnCode::Denied));
        assert!(reply.get_str(attr::REASON).unwrap().contains("Authentication"));
        assert!(acceptor.sessions().is_empty().await);
    }

    #[tokio::test]
    async fn test_datagram_unknown_session_yields_notice() {
        let acceptor = acceptor(SecurityConfig::default());
        let mut writer = DatagramWriter::new(acceptor.cipher().clone());
        writer
            .set_session("S9,127.0.0.1:7000", None, false, false)
            .unwrap();
        writer.push(WireMessage::Command(421));
        let packet = writer.finish().unwrap();

        let mut errors = ErrorStack::new();
        let outcome = acceptor
            .accept_datagram(&packet, "127.0.0.1:5555", &mut errors)
            .await
            .unwrap();
        let AcceptOutcome::SessionNotFound(notice) = outcome else {
            panic!("expected a notice, got {outcome:?}");
        };
        assert_eq!(notice.session_id, "S9");
        assert_eq!(notice.return_address.as_deref(), Some("127.0.0.1:7000"));

        let notice_packet = notice.to_packet(acceptor.cipher().clone()).unwrap();
        assert!(!notice_packet.header.sealed && !notice_packet.header.signed);
    }

    #[tokio::test]
    async fn test_notice_invalidates_session() {
        let acceptor = acceptor(SecurityConfig::default());
        let mut policy = NegotiationRecord::new();
        policy.set(attr::VALID_COMMANDS, "421");
        acceptor
            .sessions()
            .insert(SessionEntry::new("S1", policy, Instant::now()), None)
            .await
            .unwrap();

        let notice = SessionNotFoundNotice {
            session_id: "S1".into(),
            return_address: None,
        };
        let packet = notice.to_packet(acceptor.cipher().clone()).unwrap();
        let mut errors = ErrorStack::new();
        let outcome = acceptor
            .accept_datagram(&packet, "127.0.0.1:5555", &mut errors)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            AcceptOutcome::Invalidated {
                session_id: Some("S1".into()),
                removed: true,
            }
        );
        assert!(!acceptor.sessions().contains("S1").await);
    }

    #[tokio::test]
    async fn test_foreign_cookie_rejected() {
        let acceptor = acceptor(SecurityConfig::default());
        let mut writer = DatagramWriter::new(acceptor.cipher().clone());
        writer.set_cookie("not-our-cookie");
        writer.push(WireMessage::Command(422));
        let packet = writer.finish().unwrap();

        let mut errors = ErrorStack::new();
        let outcome = acceptor
            .accept_datagram(&packet, "127.0.0.1:5555", &mut errors)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            AcceptOutcome::Rejected { code: ReturnCode::Denied, .. }
        ));
    }

    #[tokio::test]
    async fn test_own_cookie_is_trusted() {
        let identity = Arc::new(ProcessIdentity::new());
        let acceptor = acceptor(SecurityConfig::default()).with_identity(identity.clone());
        let mut writer = DatagramWriter::new(acceptor.cipher().clone());
        writer.set_cookie(identity.cookie());
        writer.push(WireMessage::Command(422));
        writer.push(WireMessage::data(b"payload"));
        let packet = writer.finish().unwrap();

        let mut errors = ErrorStack::new();
        let outcome = acceptor
            .accept_datagram(&packet, "127.0.0.1:5555", &mut errors)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            AcceptOutcome::Completed {
                command: 422,
                session_id: None,
                identity: Some(LOCAL_IDENTITY.to_string()),
                new_session: false,
            }
        );
    }

    #[tokio::test]
    async fn test_unauthenticated_datagram_denied_for_write() {
        let acceptor = acceptor(SecurityConfig::default());
        let mut writer = DatagramWriter::new(acceptor.cipher().clone());
        writer.push(WireMessage::Command(422));
        let packet = writer.finish().unwrap();

        let mut errors = ErrorStack::new();
        let outcome = acceptor
            .accept_datagram(&packet, "127.0.0.1:5555", &mut errors)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            AcceptOutcome::Rejected { command: 422, code: ReturnCode::Denied, .. }
        ));
    }
}
