//! Session cipher selected by a one-byte tag the client proposes during the
//! legacy handshake (§4.2, §6). Only one member is defined in this
//! implementation's enumeration: AES-256-GCM under tag `'c'`.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;

use crate::consts::CIPHER_TAG_AES256GCM;
use crate::error::{Result, ServerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherTag {
    Aes256Gcm,
}

impl CipherTag {
    pub fn from_byte(b: u8) -> Result<Self> {
        match b {
            CIPHER_TAG_AES256GCM => Ok(CipherTag::Aes256Gcm),
            other => Err(ServerError::Protocol(format!(
                "unknown cipher tag '{}'",
                other as char
            ))),
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            CipherTag::Aes256Gcm => CIPHER_TAG_AES256GCM,
        }
    }
}

const NONCE_LEN: usize = 12;

/// A session cipher bound to one connection's session key.
pub struct SessionCipher {
    tag: CipherTag,
    cipher: Aes256Gcm,
}

impl SessionCipher {
    /// `key` must be exactly 32 bytes (the size the legacy handshake's
    /// encrypted session key decodes to for AES-256-GCM).
    pub fn new(tag: CipherTag, key: &[u8]) -> Result<Self> {
        match tag {
            CipherTag::Aes256Gcm => {
                if key.len() != 32 {
                    return Err(ServerError::Protocol(format!(
                        "session key must be 32 bytes for AES-256-GCM, got {}",
                        key.len()
                    )));
                }
                let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
                Ok(Self { tag, cipher })
            }
        }
    }

    pub fn tag(&self) -> CipherTag {
        self.tag
    }

    /// Encrypt one frame payload. A fresh random nonce is generated and
    /// prepended to the ciphertext.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ct = self
            .cipher
            .encrypt(nonce, Payload::from(plaintext))
            .map_err(|_| ServerError::Internal("AEAD encrypt failed".to_string()))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    /// Decrypt a buffer produced by `encrypt` (nonce prefix + ciphertext).
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < NONCE_LEN {
            return Err(ServerError::Protocol("ciphertext too short for nonce".to_string()));
        }
        let (nonce_bytes, ct) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, Payload::from(ct))
            .map_err(|_| ServerError::Protocol("AEAD decrypt/verify failed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let key = [7u8; 32];
        let c = SessionCipher::new(CipherTag::Aes256Gcm, &key).unwrap();
        let pt = b"SGET some/path";
        let ct = c.encrypt(pt).unwrap();
        let back = c.decrypt(&ct).unwrap();
        assert_eq!(back, pt);
    }

    #[test]
    fn rejects_wrong_key_len() {
        let key = [7u8; 16];
        assert!(SessionCipher::new(CipherTag::Aes256Gcm, &key).is_err());
    }

    #[test]
    fn rejects_tampered_ciphertext() {
        let key = [1u8; 32];
        let c = SessionCipher::new(CipherTag::Aes256Gcm, &key).unwrap();
        let mut ct = c.encrypt(b"hello").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0xFF;
        assert!(c.decrypt(&ct).is_err());
    }

    #[test]
    fn unknown_tag_rejected() {
        assert!(CipherTag::from_byte(b'x').is_err());
        assert_eq!(CipherTag::from_byte(b'c').unwrap(), CipherTag::Aes256Gcm);
    }
}
