//! Datagram packets.
//!
//! A datagram carries every message of one command in a single packet. The
//! header names the session whose key protects the body, or carries the
//! same-process cookie instead:
//!
//! ```text
//! { header: { mac_key_id: "<sid>,<return addr>",
//!             enc_key_id: "<sid>,<return addr>",
//!             cookie, sealed, signed },
//!   body:   base64(JSON [WireMessage, ...]  sealed/signed),
//!   crc32:  checksum of the decoded body }
//! ```

use std::sync::Arc;

use base64::Engine;
use serde::{Deserialize, Serialize};

use super::channel::WireMessage;
use crate::crypto::{CipherCapability, CryptoError, SessionKey};
use crate::error::{Result, SecManError};

/// Largest packet we send or accept
pub const MAX_DATAGRAM_SIZE: usize = 60 * 1024;

/// Datagram header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatagramHeader {
    /// `"<session id>,<return address>"` when the body is signed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac_key_id: Option<String>,
    /// `"<session id>,<return address>"` when the body is sealed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enc_key_id: Option<String>,
    /// Same-process proof token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cookie: Option<String>,
    /// Body is sealed
    #[serde(default)]
    pub sealed: bool,
    /// Body is signed
    #[serde(default)]
    pub signed: bool,
}

impl DatagramHeader {
    fn key_id(&self) -> Option<&str> {
        self.enc_key_id.as_deref().or(self.mac_key_id.as_deref())
    }

    /// Session the body is protected with
    pub fn session_id(&self) -> Option<&str> {
        self.key_id()
            .map(|id| id.split_once(',').map_or(id, |(sid, _)| sid))
    }

    /// Address the sender wants replies on
    pub fn return_address(&self) -> Option<&str> {
        self.key_id()
            .and_then(|id| id.split_once(','))
            .map(|(_, addr)| addr)
            .filter(|addr| !addr.is_empty())
    }
}

/// One datagram.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatagramPacket {
    /// Header
    pub header: DatagramHeader,
    /// Body, base64 of the (possibly protected) message list
    pub body: String,
    /// CRC32 over the decoded body
    pub crc32: u32,
}

impl DatagramPacket {
    /// Encode for the socket
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes = serde_json::to_vec(self)?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(SecManError::Protocol(format!(
                "datagram of {} bytes exceeds limit",
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    /// Decode from the socket
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Collects messages for one datagram and protects them on
/// [`DatagramWriter::finish`].
#[derive(Debug)]
pub struct DatagramWriter {
    cipher: Arc<dyn CipherCapability>,
    header: DatagramHeader,
    key: Option<SessionKey>,
    messages: Vec<WireMessage>,
}

impl DatagramWriter {
    /// Start an unprotected datagram
    pub fn new(cipher: Arc<dyn CipherCapability>) -> Self {
        Self {
            cipher,
            header: DatagramHeader::default(),
            key: None,
            messages: Vec::new(),
        }
    }

    /// Protect the body with a session key. `key_id` is
    /// `"<session id>,<return address>"`.
    pub fn set_session(
        &mut self,
        key_id: &str,
        key: Option<SessionKey>,
        encrypt: bool,
        integrity: bool,
    ) -> Result<()> {
        if (encrypt || integrity) && key.is_none() {
            return Err(CryptoError::NoKey(if encrypt { "encryption" } else { "integrity" }).into());
        }
        self.header.enc_key_id = encrypt.then(|| key_id.to_string());
        self.header.mac_key_id = (integrity || !encrypt).then(|| key_id.to_string());
        self.header.sealed = encrypt;
        self.header.signed = integrity && !encrypt;
        self.key = key;
        Ok(())
    }

    /// Attach the same-process cookie
    pub fn set_cookie(&mut self, cookie: impl Into<String>) {
        self.header.cookie = Some(cookie.into());
    }

    /// Header as it stands
    pub fn header(&self) -> &DatagramHeader {
        &self.header
    }

    /// Queue a message
    pub fn push(&mut self, message: WireMessage) {
        self.messages.push(message);
    }

    /// Seal or sign the queued messages and produce the packet
    pub fn finish(self) -> Result<DatagramPacket> {
        let plain = serde_json::to_vec(&self.messages)?;
        let body = match (&self.key, self.header.sealed, self.header.signed) {
            (Some(key), true, _) => {
                let aad = self.header.enc_key_id.as_deref().unwrap_or_default();
                self.cipher.seal(key, &plain, aad.as_bytes())?
            }
            (Some(key), false, true) => self.cipher.sign(key, &plain)?,
            _ => plain,
        };
        Ok(DatagramPacket {
            header: self.header,
            crc32: crc32fast::hash(&body),
            body: base64::engine::general_purpose::STANDARD.encode(body),
        })
    }
}

/// Opens datagrams written by [`DatagramWriter`].
#[derive(Debug, Clone)]
pub struct DatagramReader {
    cipher: Arc<dyn CipherCapability>,
}

impl DatagramReader {
    /// Create a reader
    pub fn new(cipher: Arc<dyn CipherCapability>) -> Self {
        Self { cipher }
    }

    /// Check the checksum, then open or verify the body with `key`
    pub fn open(&self, packet: &DatagramPacket, key: Option<&SessionKey>) -> Result<Vec<WireMessage>> {
        let body = base64::engine::general_purpose::STANDARD.decode(&packet.body)?;
        if crc32fast::hash(&body) != packet.crc32 {
            return Err(SecManError::Protocol("datagram checksum mismatch".into()));
        }

        let plain = if packet.header.sealed {
            let key = key.ok_or(CryptoError::NoKey("sealed datagram"))?;
            let aad = packet.header.enc_key_id.as_deref().unwrap_or_default();
            self.cipher.open(key, &body, aad.as_bytes())?
        } else if packet.header.signed {
            let key = key.ok_or(CryptoError::NoKey("signed datagram"))?;
            self.cipher.verify(key, &body)?
        } else {
            body
        };
        Ok(serde_json::from_slice(&plain)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{ChaChaCipher, CHACHA20};

    fn cipher() -> Arc<dyn CipherCapability> {
        Arc::new(ChaChaCipher::new())
    }

    #[test]
    fn test_header_key_id_parsing() {
        let header = DatagramHeader {
            mac_key_id: Some("1234:abcd,10.0.0.1:9618".into()),
            ..Default::default()
        };
        assert_eq!(header.session_id(), Some("1234:abcd"));
        assert_eq!(header.return_address(), Some("10.0.0.1:9618"));

        let bare = DatagramHeader {
            enc_key_id: Some("S1".into()),
            ..Default::default()
        };
        assert_eq!(bare.session_id(), Some("S1"));
        assert_eq!(bare.return_address(), None);
    }

    #[test]
    fn test_sealed_datagram() {
        let key = ChaChaCipher::new().generate_key(CHACHA20).unwrap();
        let mut writer = DatagramWriter::new(cipher());
        writer
            .set_session("S1,127.0.0.1:1", Some(key.clone()), true, false)
            .unwrap();
        writer.push(WireMessage::Command(421));
        writer.push(WireMessage::data(b"hello"));
        let packet = DatagramPacket::from_bytes(&writer.finish().unwrap().to_bytes().unwrap()).unwrap();

        assert!(packet.header.sealed);
        assert_eq!(packet.header.session_id(), Some("S1"));

        let reader = DatagramReader::new(cipher());
        let messages = reader.open(&packet, Some(&key)).unwrap();
        assert_eq!(messages[0], WireMessage::Command(421));
        assert!(reader.open(&packet, None).is_err());
    }

    #[test]
    fn test_signed_datagram_tamper_detected() {
        let key = ChaChaCipher::new().generate_key(CHACHA20).unwrap();
        let mut writer = DatagramWriter::new(cipher());
        writer
            .set_session("S1,127.0.0.1:1", Some(key.clone()), false, true)
            .unwrap();
        writer.push(WireMessage::Command(421));
        let mut packet = writer.finish().unwrap();

        let engine = base64::engine::general_purpose::STANDARD;
        let mut body = engine.decode(&packet.body).unwrap();
        body[0] ^= 0xff;
        packet.body = engine.encode(&body);
        packet.crc32 = crc32fast::hash(&body);

        assert!(DatagramReader::new(cipher()).open(&packet, Some(&key)).is_err());
    }

    #[test]
    fn test_checksum_mismatch() {
        let mut writer = DatagramWriter::new(cipher());
        writer.push(WireMessage::Command(1));
        let mut packet = writer.finish().unwrap();
        packet.crc32 ^= 1;
        assert!(matches!(
            DatagramReader::new(cipher()).open(&packet, None),
            Err(SecManError::Protocol(_))
        ));
    }

    #[test]
    fn test_integrity_without_key_fails() {
        let mut writer = DatagramWriter::new(cipher());
        assert!(writer.set_session("S1,a", None, false, true).is_err());
        // a session id with features off still names the session
        writer.set_session("S1,a", None, false, false).unwrap();
        assert_eq!(writer.header().session_id(), Some("S1"));
    }
}
