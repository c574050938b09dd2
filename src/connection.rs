//! Per-connection state (spec.md §3). Owned exclusively by the worker
//! thread handling it; never touched by any other worker.

use std::io::{Read, Write};
use std::net::TcpStream;

use crate::crypto::SessionCipher;
use crate::error::{Result, ServerError};
use crate::framing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolVariant {
    Classic,
    Tls,
}

/// The transport a connection reads/writes over. Framing (`framing.rs`) is
/// identical across both; only the underlying stream differs.
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<rustls::StreamOwned<rustls::ServerConnection, TcpStream>>),
}

impl Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(s) => s.read(buf),
            Transport::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Transport::Plain(s) => s.write(buf),
            Transport::Tls(s) => s.write(buf),
        }
    }
    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Transport::Plain(s) => s.flush(),
            Transport::Tls(s) => s.flush(),
        }
    }
}

/// Per-request authorization and identity flags. `id_verified`/`rsa_auth`
/// are write-once (set true, never reset); `map_root` is reset at the
/// start of every ACL evaluation (§3 invariants).
pub struct Connection {
    pub transport: Transport,
    pub variant: ProtocolVariant,

    pub peer_ip: String,
    pub hostname: Option<String>,
    pub username: Option<String>,
    pub key_digest_hex: Option<String>,

    pub id_verified: bool,
    pub rsa_auth: bool,
    pub trust: bool,
    pub map_root: bool,

    pub session_cipher: Option<SessionCipher>,

    scratch: Vec<u8>,
}

impl Connection {
    pub fn new(transport: Transport, variant: ProtocolVariant, peer_ip: String) -> Self {
        Self {
            transport,
            variant,
            peer_ip,
            hostname: None,
            username: None,
            key_digest_hex: None,
            id_verified: false,
            rsa_auth: false,
            trust: false,
            map_root: false,
            session_cipher: None,
            scratch: Vec::new(),
        }
    }

    pub fn set_id_verified(&mut self) {
        self.id_verified = true;
    }

    pub fn set_rsa_auth(&mut self) {
        self.rsa_auth = true;
    }

    /// Whether the current transport/session counts as "encrypted" for
    /// ACL purposes (§4.3): TLS always does; Classic does once a session
    /// cipher has been negotiated via `SAUTH`.
    pub fn is_encrypted(&self) -> bool {
        match self.variant {
            ProtocolVariant::Tls => true,
            ProtocolVariant::Classic => self.session_cipher.is_some(),
        }
    }

    pub fn read_frame(&mut self) -> Result<framing::Frame> {
        framing::read_frame(&mut self.transport)
    }

    pub fn write_line(&mut self, line: &str) -> Result<()> {
        framing::write_line(&mut self.transport, line)
    }

    pub fn write_frame(&mut self, flag: framing::Continuation, payload: &[u8]) -> Result<()> {
        framing::write_frame(&mut self.transport, flag, payload)
    }

    /// Encrypt `plaintext` with the negotiated session cipher, refusing if
    /// none has been set up yet (secure verbs require it, §4.5).
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.session_cipher
            .as_ref()
            .ok_or_else(|| ServerError::Protocol("secure verb used before session key negotiated".to_string()))?
            .encrypt(plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.session_cipher
            .as_ref()
            .ok_or_else(|| ServerError::Protocol("secure verb used before session key negotiated".to_string()))?
            .decrypt(ciphertext)
    }

    pub fn scratch_mut(&mut self) -> &mut Vec<u8> {
        self.scratch.clear();
        &mut self.scratch
    }
}
