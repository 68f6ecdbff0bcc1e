//! TCP transport.
//!
//! Every accepted connection gets its own task running the acceptor state
//! machine over a [`ReliableChannel`]. A resume of an unknown session is
//! also reported as a datagram to the return address the peer declared.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UdpSocket};

use super::udp::{notice_socket, send_notice};
use super::{ByteStream, Connector, ReliableChannel, Transport, TransportFuture};
use crate::error::{ErrorStack, SecManError};
use crate::protocol::{AcceptOutcome, CommandAcceptor, SessionNotFoundNotice};

/// TCP command listener.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    /// Address to listen on.
    listen_addr: SocketAddr,
}

impl TcpTransport {
    /// Create a new TCP transport.
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self { listen_addr }
    }

    /// Create with default localhost address.
    pub fn localhost(port: u16) -> Self {
        Self::new(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    /// Serve on an already bound listener. Notices go out through
    /// `notices` when given, otherwise through a one-off socket.
    pub async fn serve_listener(
        listener: TcpListener,
        acceptor: Arc<CommandAcceptor>,
        notices: Option<Arc<UdpSocket>>,
    ) -> crate::error::Result<()> {
        loop {
            let (stream, peer) = listener
                .accept()
                .await
                .map_err(|e| SecManError::Transport(format!("TCP accept failed: {e}")))?;
            let _ = stream.set_nodelay(true);

            let acceptor = acceptor.clone();
            let notices = notices.clone();
            tokio::spawn(async move {
                let mut channel =
                    ReliableChannel::new(stream, peer.to_string(), acceptor.cipher().clone());
                let mut errors = ErrorStack::new();
                let result = acceptor.accept_stream(&mut channel, &mut errors).await;
                let _ = channel.close().await;
                match result {
                    Ok(AcceptOutcome::SessionNotFound(notice)) => {
                        deliver_notice(&acceptor, notices.as_deref(), &notice).await
                    }
                    Ok(outcome) => tracing::debug!(%peer, ?outcome, "command finished"),
                    Err(e) => tracing::warn!(%peer, error = %e, errors = %errors, "command failed"),
                }
            });
        }
    }
}

async fn deliver_notice(
    acceptor: &CommandAcceptor,
    socket: Option<&UdpSocket>,
    notice: &SessionNotFoundNotice,
) {
    let Some(target) = notice.return_address.as_deref() else {
        tracing::debug!(session_id = %notice.session_id, "no return address for notice");
        return;
    };
    let sent = match socket {
        Some(socket) => send_notice(socket, notice, acceptor.cipher().clone(), target).await,
        None => match notice_socket(target).await {
            Ok(socket) => send_notice(&socket, notice, acceptor.cipher().clone(), target).await,
            Err(e) => Err(e),
        },
    };
    if let Err(e) = sent {
        tracing::warn!(%target, error = %e, "notice not sent");
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::localhost(9618)
    }
}

impl Transport for TcpTransport {
    fn serve(&self, acceptor: Arc<CommandAcceptor>) -> TransportFuture<'_, ()> {
        let addr = self.listen_addr;

        Box::pin(async move {
            let listener = TcpListener::bind(addr).await.map_err(|e| {
                SecManError::Transport(format!("Failed to bind TCP to {}: {}", addr, e))
            })?;
            tracing::info!("TCP transport listening on {}", addr);

            Self::serve_listener(listener, acceptor, None).await
        })
    }

    fn name(&self) -> &'static str {
        "TCP"
    }

    fn listen_addr(&self) -> String {
        self.listen_addr.to_string()
    }
}

/// Default [`Connector`]: plain TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect<'a>(
        &'a self,
        addr: &'a str,
        timeout: Duration,
    ) -> TransportFuture<'a, Box<dyn ByteStream>> {
        Box::pin(async move {
            let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| SecManError::Timeout(format!("connect to {addr}")))?
                .map_err(|e| SecManError::Transport(format!("connect to {addr} failed: {e}")))?;
            let _ = stream.set_nodelay(true);
            tracing::debug!(peer = addr, "connected");
            Ok(Box::new(stream) as Box<dyn ByteStream>)
        })
    }
}
