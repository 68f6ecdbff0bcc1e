//! Transport layer.
//!
//! Two ways to carry a command:
//! - **Stream**: a [`ReliableChannel`] over TCP (or any async byte stream),
//!   able to run multi-round negotiation and authentication
//! - **Datagram**: one [`DatagramPacket`] over UDP, usable only with a
//!   session established beforehand over a stream
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            CommandAcceptor              │
//! │         (transport-agnostic)            │
//! └──────────────────┬──────────────────────┘
//!                    │
//!          ┌─────────┴────────┐
//!          ▼                  ▼
//! ┌─────────────────┐ ┌─────────────────┐
//! │  TcpTransport   │ │  UdpTransport   │
//! │ ReliableChannel │ │ DatagramPacket  │
//! └─────────────────┘ └─────────────────┘
//! ```

mod channel;
mod datagram;
mod tcp;
mod udp;

pub use channel::{ByteStream, ReliableChannel, WireMessage, MAX_FRAME_SIZE};
pub use datagram::{
    DatagramHeader, DatagramPacket, DatagramReader, DatagramWriter, MAX_DATAGRAM_SIZE,
};
pub use tcp::{TcpConnector, TcpTransport};
pub use udp::UdpTransport;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::protocol::CommandAcceptor;

/// Boxed future returned by transport capabilities
pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// How a command travels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportKind {
    /// Reliable stream (TCP)
    #[default]
    Tcp,
    /// Single datagram (UDP)
    Udp,
}

impl TransportKind {
    /// Get descriptive name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tcp" | "stream" | "reliable" => Ok(Self::Tcp),
            "udp" | "datagram" => Ok(Self::Udp),
            _ => Err(format!("Unknown transport kind: {}", s)),
        }
    }
}

/// Listener feeding incoming commands to an acceptor.
///
/// Implementations run until the socket fails or the future is dropped.
pub trait Transport: Send + Sync {
    /// Accept commands and hand them to `acceptor`
    fn serve(&self, acceptor: Arc<CommandAcceptor>) -> TransportFuture<'_, ()>;

    /// Get the transport name for logging.
    fn name(&self) -> &'static str;

    /// Get the listen address as a string.
    fn listen_addr(&self) -> String;
}

/// Opens reliable connections to peers.
pub trait Connector: Send + Sync + std::fmt::Debug {
    /// Connect to `addr`, failing with a timeout error after `timeout`
    fn connect<'a>(
        &'a self,
        addr: &'a str,
        timeout: Duration,
    ) -> TransportFuture<'a, Box<dyn ByteStream>>;
}
