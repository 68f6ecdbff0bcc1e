//! UDP transport.
//!
//! Packets name the session protecting them in their header. When the
//! acceptor does not know that session, a session-not-found notice goes back
//! to the return address the packet declared, so the sender drops its copy
//! and bootstraps a fresh one.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;

use super::{DatagramPacket, Transport, TransportFuture, MAX_DATAGRAM_SIZE};
use crate::crypto::CipherCapability;
use crate::error::{ErrorStack, Result, SecManError};
use crate::protocol::{AcceptOutcome, CommandAcceptor, SessionNotFoundNotice};

/// UDP command socket.
#[derive(Debug, Clone)]
pub struct UdpTransport {
    listen_addr: SocketAddr,
}

impl UdpTransport {
    /// Create a new UDP transport.
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self { listen_addr }
    }

    /// Serve on an already bound socket
    pub async fn serve_socket(socket: Arc<UdpSocket>, acceptor: Arc<CommandAcceptor>) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, from) = socket
                .recv_from(&mut buf)
                .await
                .map_err(|e| SecManError::Transport(format!("UDP receive failed: {e}")))?;

            let packet = match DatagramPacket::from_bytes(&buf[..len]) {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::warn!(%from, error = %e, "dropping malformed datagram");
                    continue;
                }
            };

            let acceptor = acceptor.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                let mut errors = ErrorStack::new();
                match acceptor
                    .accept_datagram(&packet, &from.to_string(), &mut errors)
                    .await
                {
                    Ok(AcceptOutcome::SessionNotFound(notice)) => {
                        let target = notice
                            .return_address
                            .clone()
                            .unwrap_or_else(|| from.to_string());
                        let cipher = acceptor.cipher().clone();
                        if let Err(e) = send_notice(&socket, &notice, cipher, &target).await {
                            tracing::warn!(%target, error = %e, "notice not sent");
                        }
                    }
                    Ok(outcome) => tracing::debug!(%from, ?outcome, "datagram finished"),
                    Err(e) => tracing::warn!(%from, error = %e, errors = %errors, "datagram failed"),
                }
            });
        }
    }
}

/// Send `notice` to `target` as an unprotected `DC_INVALIDATE_KEY` datagram.
pub async fn send_notice(
    socket: &UdpSocket,
    notice: &SessionNotFoundNotice,
    cipher: Arc<dyn CipherCapability>,
    target: &str,
) -> Result<()> {
    let bytes = notice.to_packet(cipher)?.to_bytes()?;
    socket.send_to(&bytes, target).await?;
    tracing::info!(
        session_id = %notice.session_id,
        %target,
        "sent session-not-found notice"
    );
    Ok(())
}

/// Unbound socket of the same family as `target`, for one-off notices
pub async fn notice_socket(target: &str) -> Result<UdpSocket> {
    let local = match target.parse::<SocketAddr>() {
        Ok(addr) if addr.is_ipv6() => "[::]:0",
        _ => "0.0.0.0:0",
    };
    UdpSocket::bind(local)
        .await
        .map_err(|e| SecManError::Transport(format!("cannot open notice socket: {e}")))
}

impl Transport for UdpTransport {
    fn serve(&self, acceptor: Arc<CommandAcceptor>) -> TransportFuture<'_, ()> {
        let addr = self.listen_addr;

        Box::pin(async move {
            let socket = UdpSocket::bind(addr).await.map_err(|e| {
                SecManError::Transport(format!("Failed to bind UDP to {}: {}", addr, e))
            })?;
            tracing::info!("UDP transport listening on {}", addr);

            Self::serve_socket(Arc::new(socket), acceptor).await
        })
    }

    fn name(&self) -> &'static str {
        "UDP"
    }

    fn listen_addr(&self) -> String {
        self.listen_addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_notice_reaches_target() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap().to_string();
        let notice = SessionNotFoundNotice {
            session_id: "S7".into(),
            return_address: Some(target.clone()),
        };

        let socket = notice_socket(&target).await.unwrap();
        let cipher: Arc<dyn CipherCapability> = Arc::new(crate::crypto::ChaChaCipher::new());
        send_notice(&socket, &notice, cipher.clone(), &target)
            .await
            .unwrap();

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        let packet = DatagramPacket::from_bytes(&buf[..len]).unwrap();
        assert_eq!(packet, notice.to_packet(cipher).unwrap());
    }

    #[test]
    fn test_udp_transport_addr() {
        let transport = UdpTransport::new("127.0.0.1:9618".parse().unwrap());
        assert_eq!(transport.listen_addr(), "127.0.0.1:9618");
        assert_eq!(transport.name(), "UDP");
    }
}
