//! Command table and handlers.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::config::Permission;
use crate::error::{Result, SecManError};
use crate::transport::{ReliableChannel, WireMessage};

/// Boxed future returned by command handlers
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// What the acceptor knows about a command when it dispatches it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandContext {
    /// Command number
    pub command: u32,
    /// Peer address
    pub peer: String,
    /// Authenticated identity of the peer
    pub identity: Option<String>,
    /// Permission level the command was authorized under
    pub permission: Permission,
    /// Session the command arrived on
    pub session_id: Option<String>,
}

/// Where a handler reads its payload from and writes its reply to.
#[derive(Debug)]
pub enum CommandIo<'a> {
    /// Interactive reliable channel
    Stream(&'a mut ReliableChannel),
    /// Remaining messages of a datagram; replies are impossible
    Datagram(VecDeque<WireMessage>),
}

impl CommandIo<'_> {
    /// Next payload message
    pub async fn recv(&mut self) -> Result<WireMessage> {
        match self {
            CommandIo::Stream(channel) => channel.recv().await,
            CommandIo::Datagram(messages) => messages
                .pop_front()
                .ok_or_else(|| SecManError::Protocol("datagram payload exhausted".into())),
        }
    }

    /// Next payload message as bytes
    pub async fn recv_data(&mut self) -> Result<Vec<u8>> {
        self.recv().await?.into_data()
    }

    /// Reply to the peer
    pub async fn send(&mut self, message: &WireMessage) -> Result<()> {
        match self {
            CommandIo::Stream(channel) => channel.send(message).await,
            CommandIo::Datagram(_) => Err(SecManError::Protocol(
                "datagram commands cannot reply".into(),
            )),
        }
    }

    /// Reply with bytes
    pub async fn send_data(&mut self, bytes: &[u8]) -> Result<()> {
        self.send(&WireMessage::data(bytes)).await
    }

    /// Whether replies are possible
    pub fn is_stream(&self) -> bool {
        matches!(self, CommandIo::Stream(_))
    }
}

/// Runs one command after it was authorized.
pub trait CommandHandler: Send + Sync + fmt::Debug {
    /// Handle the command
    fn handle<'a>(&'a self, ctx: CommandContext, io: CommandIo<'a>) -> HandlerFuture<'a>;
}

/// Reply with each payload message received; datagram payloads are only
/// logged.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl CommandHandler for EchoHandler {
    fn handle<'a>(&'a self, ctx: CommandContext, mut io: CommandIo<'a>) -> HandlerFuture<'a> {
        Box::pin(async move {
            let payload = io.recv_data().await?;
            tracing::debug!(
                command = ctx.command,
                peer = %ctx.peer,
                identity = ctx.identity.as_deref().unwrap_or("-"),
                bytes = payload.len(),
                "echo"
            );
            if io.is_stream() {
                io.send_data(&payload).await?;
            }
            Ok(())
        })
    }
}

/// One registered command.
#[derive(Debug, Clone)]
pub struct CommandEntry {
    /// Display name
    pub name: String,
    /// Permission level the peer must hold
    pub permission: Permission,
    /// Refuse unauthenticated peers regardless of policy
    pub force_authentication: bool,
    /// Handler
    pub handler: Arc<dyn CommandHandler>,
}

/// Command number → required permission and handler.
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    commands: BTreeMap<u32, CommandEntry>,
}

impl CommandTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command, replacing any previous registration
    pub fn register(
        &mut self,
        command: u32,
        name: impl Into<String>,
        permission: Permission,
        handler: Arc<dyn CommandHandler>,
    ) -> &mut Self {
        self.commands.insert(
            command,
            CommandEntry {
                name: name.into(),
                permission,
                force_authentication: false,
                handler,
            },
        );
        self
    }

    /// Mark a registered command as always requiring authentication
    pub fn force_authentication(&mut self, command: u32) -> &mut Self {
        if let Some(entry) = self.commands.get_mut(&command) {
            entry.force_authentication = true;
        }
        self
    }

    /// Entry for `command`
    pub fn get(&self, command: u32) -> Option<&CommandEntry> {
        self.commands.get(&command)
    }

    /// Permission `command` requires
    pub fn permission_of(&self, command: u32) -> Option<Permission> {
        self.get(command).map(|e| e.permission)
    }

    /// Commands usable by a peer granted `permission`, as decimal strings
    pub fn commands_for(&self, permission: Permission) -> Vec<String> {
        self.commands
            .iter()
            .filter(|(_, entry)| permission.implies(entry.permission))
            .map(|(command, _)| command.to_string())
            .collect()
    }

    /// Commands whose required permission passes `allowed`
    pub fn authorized_commands(&self, allowed: impl Fn(Permission) -> bool) -> Vec<String> {
        self.commands
            .iter()
            .filter(|(_, entry)| allowed(entry.permission))
            .map(|(command, _)| command.to_string())
            .collect()
    }

    /// Number of registered commands
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Check if no commands are registered
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
