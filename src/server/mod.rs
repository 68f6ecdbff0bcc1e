//! Daemon side: command table, authorization, self identity and the
//! listeners that feed the acceptor.
//!
//! # Example
//!
//! ```rust,ignore
//! use secman::server::{CommandTable, Daemon, EchoHandler};
//!
//! let mut commands = CommandTable::new();
//! commands.register(421, "QUERY", Permission::Read, Arc::new(EchoHandler));
//! let daemon = Daemon::new(Arc::new(config), commands);
//! daemon.bind().await?.serve().await?;
//! ```

mod admin;
mod authz;
mod commands;
mod identity;

pub use admin::{admin_router, AdminState, HealthResponse};
pub use authz::{AllowList, AuthorizationPolicy, UNAUTHENTICATED};
pub use commands::{
    CommandContext, CommandEntry, CommandHandler, CommandIo, CommandTable, EchoHandler,
    HandlerFuture,
};
pub use identity::{ProcessIdentity, SelfIdentity, LOCAL_IDENTITY};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};

use crate::auth::AuthRegistry;
use crate::config::SecurityConfig;
use crate::error::{Result, SecManError};
use crate::protocol::{CommandAcceptor, CommandInitiator};
use crate::session::SessionService;
use crate::transport::{TcpTransport, UdpTransport};

/// One process's negotiation engine: a shared session cache used by both
/// the acceptor and the initiator.
#[derive(Debug, Clone)]
pub struct Daemon {
    config: Arc<SecurityConfig>,
    sessions: Arc<SessionService>,
    identity: Arc<ProcessIdentity>,
    acceptor: Arc<CommandAcceptor>,
    initiator: CommandInitiator,
}

impl Daemon {
    /// Daemon serving `commands` under `config`
    pub fn new(config: Arc<SecurityConfig>, commands: CommandTable) -> Self {
        let sessions = Arc::new(SessionService::new());
        let identity = Arc::new(ProcessIdentity::new());
        let acceptor = CommandAcceptor::new(config.clone(), sessions.clone(), Arc::new(commands))
            .with_identity(identity.clone());
        let initiator =
            CommandInitiator::new(config.clone(), sessions.clone()).with_identity(identity.clone());
        Self {
            config,
            sessions,
            identity,
            acceptor: Arc::new(acceptor),
            initiator,
        }
    }

    /// Use `auth` on both sides
    pub fn with_auth(mut self, auth: Arc<AuthRegistry>) -> Self {
        self.acceptor = Arc::new((*self.acceptor).clone().with_auth(auth.clone()));
        self.initiator = self.initiator.with_auth(auth);
        self
    }

    /// Replace the authorization policy
    pub fn with_authz(mut self, authz: Arc<dyn AuthorizationPolicy>) -> Self {
        self.acceptor = Arc::new((*self.acceptor).clone().with_authz(authz));
        self
    }

    /// Shared session cache
    pub fn sessions(&self) -> &Arc<SessionService> {
        &self.sessions
    }

    /// Process identity
    pub fn identity(&self) -> &Arc<ProcessIdentity> {
        &self.identity
    }

    /// Acceptor for incoming commands
    pub fn acceptor(&self) -> &Arc<CommandAcceptor> {
        &self.acceptor
    }

    /// Initiator for commands this daemon sends
    pub fn initiator(&self) -> &CommandInitiator {
        &self.initiator
    }

    /// Bind every configured socket and register the bound addresses as
    /// our own.
    pub async fn bind(self) -> Result<BoundDaemon> {
        let server = &self.config.server;
        let tcp = TcpListener::bind(&server.tcp_addr).await.map_err(|e| {
            SecManError::Transport(format!("Failed to bind TCP to {}: {}", server.tcp_addr, e))
        })?;
        self.identity.register_address(tcp.local_addr()?.to_string());

        let udp = match &server.udp_addr {
            Some(addr) => {
                let socket = UdpSocket::bind(addr).await.map_err(|e| {
                    SecManError::Transport(format!("Failed to bind UDP to {}: {}", addr, e))
                })?;
                self.identity.register_address(socket.local_addr()?.to_string());
                Some(socket)
            }
            None => None,
        };

        let admin = match &server.admin_addr {
            Some(addr) => Some(TcpListener::bind(addr).await.map_err(|e| {
                SecManError::Transport(format!("Failed to bind admin to {}: {}", addr, e))
            })?),
            None => None,
        };

        Ok(BoundDaemon {
            daemon: self,
            tcp,
            udp,
            admin,
        })
    }
}

/// A [`Daemon`] whose sockets are bound.
#[derive(Debug)]
pub struct BoundDaemon {
    daemon: Daemon,
    tcp: TcpListener,
    udp: Option<UdpSocket>,
    admin: Option<TcpListener>,
}

impl BoundDaemon {
    /// Bound command address
    pub fn tcp_addr(&self) -> Result<SocketAddr> {
        Ok(self.tcp.local_addr()?)
    }

    /// Bound datagram address
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.udp.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Bound admin address
    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// The daemon behind the sockets
    pub fn daemon(&self) -> &Daemon {
        &self.daemon
    }

    /// Serve until a listener fails.
    pub async fn serve(self) -> Result<()> {
        let Self {
            daemon,
            tcp,
            udp,
            admin,
        } = self;

        tracing::info!("TCP transport listening on {}", tcp.local_addr()?);
        if let Some(socket) = &udp {
            tracing::info!("UDP transport listening on {}", socket.local_addr()?);
        }
        let admin_app = admin_router(AdminState::new(daemon.sessions.clone()));
        if let Some(listener) = &admin {
            tracing::info!("Admin endpoint listening on http://{}", listener.local_addr()?);
        }

        let udp = udp.map(Arc::new);
        let notices = udp.clone();
        let acceptor = daemon.acceptor.clone();
        let udp_acceptor = daemon.acceptor.clone();
        let sweep_every = Duration::from_secs(daemon.config.server.sweep_interval_secs.max(1));

        tokio::select! {
            result = TcpTransport::serve_listener(tcp, acceptor, notices) => {
                tracing::info!("TCP transport stopped");
                result
            }
            result = async move {
                match udp {
                    Some(socket) => UdpTransport::serve_socket(socket, udp_acceptor).await,
                    None => std::future::pending().await,
                }
            } => {
                tracing::info!("UDP transport stopped");
                result
            }
            result = async move {
                match admin {
                    Some(listener) => axum::serve(listener, admin_app)
                        .await
                        .map_err(|e| SecManError::Transport(format!("Admin server error: {}", e))),
                    None => std::future::pending().await,
                }
            } => {
                tracing::info!("Admin endpoint stopped");
                result
            }
            () = sweep_loop(daemon.sessions.clone(), sweep_every) => Ok(()),
        }
    }
}

async fn sweep_loop(sessions: Arc<SessionService>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let swept = sessions.sweep_expired().await;
        if !swept.is_empty() {
            tracing::info!(count = swept.len(), "expired sessions swept");
        }
    }
}
