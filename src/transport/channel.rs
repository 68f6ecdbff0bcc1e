//! Reliable message channel.
//!
//! Length-prefixed frames over any async byte stream (TCP socket or an
//! in-memory duplex in tests):
//!
//! ```text
//! ┌──────────────┬─────────┬──────────────────────────────┐
//! │ length: u32  │ flags   │ payload (JSON WireMessage)   │
//! │ big endian   │ 1 byte  │ sealed or signed per flags   │
//! └──────────────┴─────────┴──────────────────────────────┘
//! ```
//!
//! The channel holds the session key and two switches. Outgoing frames are
//! sealed when encryption is on, otherwise signed when integrity is on.
//! While either switch is on, an unprotected incoming frame is rejected.
//!
//! A channel that resumed a cached session watches its first reply. An
//! unprotected `SID_NOT_FOUND` record or a close before any frame drops the
//! session from the cache and surfaces as [`SecManError::SessionNotFound`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::crypto::{CipherCapability, CryptoError, SessionKey};
use crate::error::{Result, SecManError};
use crate::protocol::{NegotiationRecord, ReturnCode};
use crate::session::SessionService;

/// Largest accepted frame
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const FLAG_SEALED: u8 = 0b01;
const FLAG_SIGNED: u8 = 0b10;

/// Byte stream a channel can run over.
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

/// One message on a channel or in a datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum WireMessage {
    /// Bare command number
    Command(u32),
    /// Attribute record
    Record(NegotiationRecord),
    /// Opaque payload, base64
    Data(String),
}

impl WireMessage {
    /// Wrap raw bytes
    pub fn data(bytes: &[u8]) -> Self {
        WireMessage::Data(base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    /// Short name for logs and errors
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Command(_) => "command",
            WireMessage::Record(_) => "record",
            WireMessage::Data(_) => "data",
        }
    }

    /// Unwrap a data payload
    pub fn into_data(self) -> Result<Vec<u8>> {
        match self {
            WireMessage::Data(encoded) => {
                Ok(base64::engine::general_purpose::STANDARD.decode(encoded)?)
            }
            other => Err(unexpected("data", &other)),
        }
    }

    /// Unwrap a record
    pub fn into_record(self) -> Result<NegotiationRecord> {
        match self {
            WireMessage::Record(record) => Ok(record),
            other => Err(unexpected("record", &other)),
        }
    }

    /// Unwrap a command number
    pub fn into_command(self) -> Result<u32> {
        match self {
            WireMessage::Command(cmd) => Ok(cmd),
            other => Err(unexpected("command", &other)),
        }
    }
}

fn unexpected(wanted: &str, got: &WireMessage) -> SecManError {
    SecManError::Protocol(format!("expected {wanted}, got {}", got.kind()))
}

/// Resumed session awaiting the peer's first reply.
struct ResumeWatch {
    session_id: String,
    sessions: Arc<SessionService>,
}

/// A framed, optionally protected message channel to one peer.
pub struct ReliableChannel {
    stream: Box<dyn ByteStream>,
    peer: String,
    cipher: Arc<dyn CipherCapability>,
    key: Option<SessionKey>,
    encrypt: bool,
    integrity: bool,
    deadline: Option<Instant>,
    identity: Option<String>,
    auth_method: Option<String>,
    tried_authentication: bool,
    frames_sent: u64,
    frames_received: u64,
    resumed: Option<ResumeWatch>,
}

impl fmt::Debug for ReliableChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReliableChannel")
            .field("peer", &self.peer)
            .field("encrypt", &self.encrypt)
            .field("integrity", &self.integrity)
            .field("identity", &self.identity)
            .field("frames_sent", &self.frames_sent)
            .field("frames_received", &self.frames_received)
            .field(
                "resumed",
                &self.resumed.as_ref().map(|watch| watch.session_id.as_str()),
            )
            .finish_non_exhaustive()
    }
}

impl ReliableChannel {
    /// Wrap a connected stream
    pub fn new(
        stream: impl ByteStream + 'static,
        peer: impl Into<String>,
        cipher: Arc<dyn CipherCapability>,
    ) -> Self {
        Self {
            stream: Box::new(stream),
            peer: peer.into(),
            cipher,
            key: None,
            encrypt: false,
            integrity: false,
            deadline: None,
            identity: None,
            auth_method: None,
            tried_authentication: false,
            frames_sent: 0,
            frames_received: 0,
            resumed: None,
        }
    }

    /// Peer address
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Cipher capability used for protected frames
    pub fn cipher(&self) -> &Arc<dyn CipherCapability> {
        &self.cipher
    }

    /// Arm a deadline covering every read and write from now on
    pub fn arm_deadline(&mut self, timeout: Duration) {
        self.deadline = Some(Instant::now() + timeout);
    }

    /// Remove the deadline
    pub fn clear_deadline(&mut self) {
        self.deadline = None;
    }

    /// Whether a deadline is armed
    pub fn has_deadline(&self) -> bool {
        self.deadline.is_some()
    }

    /// Install the session key and switch encryption on or off. The key is
    /// kept either way so encryption can be enabled later.
    pub fn set_crypto_key(&mut self, enable: bool, key: Option<SessionKey>) -> Result<()> {
        if key.is_some() {
            self.key = key;
        }
        if enable && self.key.is_none() {
            return Err(CryptoError::NoKey("encryption").into());
        }
        self.encrypt = enable;
        Ok(())
    }

    /// Install the session key and switch integrity on or off.
    pub fn set_integrity(&mut self, enable: bool, key: Option<SessionKey>) -> Result<()> {
        if key.is_some() {
            self.key = key;
        }
        if enable && self.key.is_none() {
            return Err(CryptoError::NoKey("integrity").into());
        }
        self.integrity = enable;
        Ok(())
    }

    /// Toggle encryption with the key already installed
    pub fn set_encryption(&mut self, enable: bool) -> Result<()> {
        self.set_crypto_key(enable, None)
    }

    /// Installed session key
    pub fn key(&self) -> Option<&SessionKey> {
        self.key.as_ref()
    }

    /// Whether outgoing frames are sealed
    pub fn is_encrypted(&self) -> bool {
        self.encrypt
    }

    /// Whether outgoing frames are signed
    pub fn has_integrity(&self) -> bool {
        self.integrity
    }

    /// Record the peer's authenticated identity
    pub fn set_authenticated(&mut self, identity: Option<String>, method: impl Into<String>) {
        self.identity = identity;
        self.auth_method = Some(method.into());
        self.tried_authentication = true;
    }

    /// Note that authentication was attempted (successfully or not)
    pub fn set_tried_authentication(&mut self, tried: bool) {
        self.tried_authentication = tried;
    }

    /// Authenticated identity of the peer, if any
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Method the identity was established with
    pub fn auth_method(&self) -> Option<&str> {
        self.auth_method.as_deref()
    }

    /// Whether the peer's identity is known
    pub fn is_authenticated(&self) -> bool {
        self.identity.is_some()
    }

    /// Whether authentication was attempted on this channel
    pub fn tried_authentication(&self) -> bool {
        self.tried_authentication
    }

    /// Check the next incoming frame against `session_id`, resumed from
    /// `sessions` without a round trip.
    pub fn watch_resumed(&mut self, session_id: impl Into<String>, sessions: Arc<SessionService>) {
        self.resumed = Some(ResumeWatch {
            session_id: session_id.into(),
            sessions,
        });
    }

    /// Resumed session whose first reply has not arrived yet
    pub fn resumed_session(&self) -> Option<&str> {
        self.resumed.as_ref().map(|watch| watch.session_id.as_str())
    }

    /// Frames written
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Frames read
    pub fn frames_received(&self) -> u64 {
        self.frames_received
    }

    fn protect(&self, payload: Vec<u8>) -> Result<(u8, Vec<u8>)> {
        match (&self.key, self.encrypt, self.integrity) {
            (Some(key), true, _) => Ok((FLAG_SEALED, self.cipher.seal(key, &payload, &[FLAG_SEALED])?)),
            (Some(key), false, true) => Ok((FLAG_SIGNED, self.cipher.sign(key, &payload)?)),
            (None, true, _) => Err(CryptoError::NoKey("encryption").into()),
            (None, false, true) => Err(CryptoError::NoKey("integrity").into()),
            (_, false, false) => Ok((0, payload)),
        }
    }

    fn unprotect(&self, flags: u8, payload: Vec<u8>) -> Result<Vec<u8>> {
        let key = || {
            self.key
                .as_ref()
                .ok_or_else(|| SecManError::from(CryptoError::NoKey("protected frame")))
        };
        if flags & FLAG_SEALED != 0 {
            Ok(self.cipher.open(key()?, &payload, &[FLAG_SEALED])?)
        } else if flags & FLAG_SIGNED != 0 {
            Ok(self.cipher.verify(key()?, &payload)?)
        } else if self.encrypt || self.integrity {
            Err(SecManError::Protocol(format!(
                "unprotected frame from {} while protection is on",
                self.peer
            )))
        } else {
            Ok(payload)
        }
    }

    /// Write one message
    pub async fn send(&mut self, message: &WireMessage) -> Result<()> {
        let (flags, payload) = self.protect(serde_json::to_vec(message)?)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(SecManError::Protocol(format!(
                "frame of {} bytes exceeds limit",
                payload.len()
            )));
        }
        let mut frame = Vec::with_capacity(payload.len() + 5);
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.push(flags);
        frame.extend_from_slice(&payload);

        let stream = &mut self.stream;
        guarded(self.deadline, &self.peer, "write", async {
            stream.write_all(&frame).await?;
            stream.flush().await
        })
        .await?;
        self.frames_sent += 1;
        tracing::trace!(peer = %self.peer, kind = message.kind(), flags, "sent frame");
        Ok(())
    }

    /// Read one message
    pub async fn recv(&mut self) -> Result<WireMessage> {
        let frame = self.read_frame().await;
        let Some(watch) = self.resumed.take() else {
            let (flags, payload) = frame?.ok_or_else(|| self.closed())?;
            return self.decode(flags, payload);
        };

        match frame? {
            None => Err(self.session_lost(watch, "closed the connection").await),
            Some((0, payload)) if is_sid_not_found(&payload) => {
                Err(self.session_lost(watch, "answered SID_NOT_FOUND").await)
            }
            Some((flags, payload)) => self.decode(flags, payload),
        }
    }

    /// Next frame, or `None` when the peer closed before sending one
    async fn read_frame(&mut self) -> Result<Option<(u8, Vec<u8>)>> {
        let stream = &mut self.stream;
        let header = guarded(self.deadline, &self.peer, "read", async {
            let mut header = [0u8; 5];
            if stream.read(&mut header[..1]).await? == 0 {
                return Ok(None);
            }
            stream.read_exact(&mut header[1..]).await?;
            Ok(Some(header))
        })
        .await?;
        let Some(header) = header else {
            return Ok(None);
        };

        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(SecManError::Protocol(format!(
                "frame of {len} bytes exceeds limit"
            )));
        }
        let stream = &mut self.stream;
        let payload = guarded(self.deadline, &self.peer, "read", async {
            let mut payload = vec![0u8; len];
            stream.read_exact(&mut payload).await?;
            Ok(payload)
        })
        .await?;
        Ok(Some((header[4], payload)))
    }

    fn decode(&mut self, flags: u8, payload: Vec<u8>) -> Result<WireMessage> {
        let payload = self.unprotect(flags, payload)?;
        let message: WireMessage = serde_json::from_slice(&payload)?;
        self.frames_received += 1;
        tracing::trace!(peer = %self.peer, kind = message.kind(), "received frame");
        Ok(message)
    }

    fn closed(&self) -> SecManError {
        SecManError::Protocol(format!("{} closed the connection during read", self.peer))
    }

    async fn session_lost(&mut self, watch: ResumeWatch, what: &str) -> SecManError {
        let removed = watch.sessions.invalidate_key(&watch.session_id).await;
        tracing::info!(
            session_id = %watch.session_id,
            peer = %self.peer,
            removed,
            "peer {what} on resume, session dropped"
        );
        SecManError::SessionNotFound(format!(
            "{} {what} on resume of session {}",
            self.peer, watch.session_id
        ))
    }

    /// Write a command number
    pub async fn send_command(&mut self, command: u32) -> Result<()> {
        self.send(&WireMessage::Command(command)).await
    }

    /// Write a record
    pub async fn send_record(&mut self, record: &NegotiationRecord) -> Result<()> {
        self.send(&WireMessage::Record(record.clone())).await
    }

    /// Read a command number
    pub async fn recv_command(&mut self) -> Result<u32> {
        self.recv().await?.into_command()
    }

    /// Read a record
    pub async fn recv_record(&mut self) -> Result<NegotiationRecord> {
        self.recv().await?.into_record()
    }

    /// Shut the write half down
    pub async fn close(&mut self) -> Result<()> {
        self.stream
            .shutdown()
            .await
            .map_err(|e| SecManError::Transport(format!("close {} failed: {e}", self.peer)))
    }
}

fn is_sid_not_found(payload: &[u8]) -> bool {
    matches!(
        serde_json::from_slice::<WireMessage>(payload),
        Ok(WireMessage::Record(record)) if record.return_code() == Some(ReturnCode::SidNotFound)
    )
}

/// Run one I/O operation under an optional deadline.
async fn guarded<T>(
    deadline: Option<Instant>,
    peer: &str,
    what: &str,
    io: impl Future<Output = std::io::Result<T>>,
) -> Result<T> {
    let result = match deadline {
        Some(at) => tokio::time::timeout_at(at, io)
            .await
            .map_err(|_| SecManError::Timeout(format!("{what} to {peer} exceeded deadline")))?,
        None => io.await,
    };
    result.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => {
            SecManError::Protocol(format!("{peer} closed the connection during {what}"))
        }
        _ => SecManError::Transport(format!("{what} to {peer} failed: {e}")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{ChaChaCipher, CHACHA20};
    use crate::protocol::attr;
    use crate::session::SessionEntry;

    fn pair() -> (ReliableChannel, ReliableChannel) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let cipher: Arc<dyn CipherCapability> = Arc::new(ChaChaCipher::new());
        (
            ReliableChannel::new(a, "server", cipher.clone()),
            ReliableChannel::new(b, "client", cipher),
        )
    }

    #[tokio::test]
    async fn test_plain_exchange() {
        let (mut client, mut server) = pair();
        let mut record = NegotiationRecord::new();
        record.set("SessionId", "s1");

        client.send_command(60010).await.unwrap();
        client.send_record(&record).await.unwrap();
        client.send(&WireMessage::data(b"payload")).await.unwrap();

        assert_eq!(server.recv_command().await.unwrap(), 60010);
        assert_eq!(server.recv_record().await.unwrap(), record);
        assert_eq!(server.recv().await.unwrap().into_data().unwrap(), b"payload");
        assert_eq!(client.frames_sent(), 3);
        assert_eq!(server.frames_received(), 3);
    }

    #[tokio::test]
    async fn test_encrypted_and_signed_frames() {
        let (mut client, mut server) = pair();
        let key = ChaChaCipher::new().generate_key(CHACHA20).unwrap();

        client.set_crypto_key(true, Some(key.clone())).unwrap();
        server.set_crypto_key(true, Some(key.clone())).unwrap();
        client.send_command(7).await.unwrap();
        assert_eq!(server.recv_command().await.unwrap(), 7);

        client.set_encryption(false).unwrap();
        client.set_integrity(true, None).unwrap();
        server.set_encryption(false).unwrap();
        server.set_integrity(true, None).unwrap();
        client.send_command(8).await.unwrap();
        assert_eq!(server.recv_command().await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_unprotected_frame_rejected_when_integrity_on() {
        let (mut client, mut server) = pair();
        let key = ChaChaCipher::new().generate_key(CHACHA20).unwrap();
        server.set_integrity(true, Some(key)).unwrap();

        client.send_command(1).await.unwrap();
        assert!(matches!(
            server.recv().await,
            Err(SecManError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_enable_without_key_fails() {
        let (mut client, _server) = pair();
        assert!(client.set_integrity(true, None).is_err());
        assert!(client.set_crypto_key(true, None).is_err());
        // key retained while features stay off
        let key = ChaChaCipher::new().generate_key(CHACHA20).unwrap();
        client.set_crypto_key(false, Some(key)).unwrap();
        assert!(client.key().is_some());
        assert!(!client.is_encrypted());
        client.set_encryption(true).unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires() {
        let (mut client, _server) = pair();
        client.arm_deadline(Duration::from_secs(5));
        let err = client.recv().await.unwrap_err();
        assert!(matches!(err, SecManError::Timeout(_)));
    }

    async fn cached(id: &str) -> Arc<SessionService> {
        let sessions = Arc::new(SessionService::new());
        sessions
            .insert(
                SessionEntry::new(id, NegotiationRecord::new(), std::time::Instant::now()),
                None,
            )
            .await
            .unwrap();
        sessions
    }

    #[tokio::test]
    async fn test_sid_not_found_drops_resumed_session() {
        let sessions = cached("S1").await;
        let (mut client, mut server) = pair();
        let key = ChaChaCipher::new().generate_key(CHACHA20).unwrap();
        client.set_crypto_key(true, Some(key)).unwrap();
        client.watch_resumed("S1", sessions.clone());

        let mut notice = NegotiationRecord::new();
        notice.set(attr::SESSION_ID, "S1");
        notice.set(attr::RETURN_CODE, ReturnCode::SidNotFound.as_str());
        server.send_record(&notice).await.unwrap();

        let err = client.recv().await.unwrap_err();
        assert!(matches!(err, SecManError::SessionNotFound(_)));
        assert!(!sessions.contains("S1").await);
        assert!(client.resumed_session().is_none());
    }

    #[tokio::test]
    async fn test_close_before_first_reply_drops_resumed_session() {
        let sessions = cached("S1").await;
        let (mut client, server) = pair();
        client.watch_resumed("S1", sessions.clone());
        drop(server);

        assert!(matches!(
            client.recv().await,
            Err(SecManError::SessionNotFound(_))
        ));
        assert!(sessions.is_empty().await);
    }

    #[tokio::test]
    async fn test_resumed_session_kept_after_first_reply() {
        let sessions = cached("S1").await;
        let (mut client, mut server) = pair();
        client.watch_resumed("S1", sessions.clone());

        server.send(&WireMessage::data(b"ok")).await.unwrap();
        assert_eq!(client.recv().await.unwrap().into_data().unwrap(), b"ok");
        drop(server);

        // later closes are ordinary
        assert!(matches!(client.recv().await, Err(SecManError::Protocol(_))));
        assert!(sessions.contains("S1").await);
    }

    #[tokio::test]
    async fn test_peer_close_is_protocol_error() {
        let (mut client, server) = pair();
        drop(server);
        assert!(matches!(
            client.recv().await,
            Err(SecManError::Protocol(_))
        ));
    }
}
