//! Long-term asymmetric identity: a single RSA keypair loaded at startup.
//! A peer's identity is the digest of its public key.

use anyhow::{Context, Result};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs1v15::Pkcs1v15Encrypt;
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::path::Path;
use zeroize::Zeroize;

/// Canonical 256-bit digest used for key pinning and content compare.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct KeyDigest(pub [u8; 32]);

impl KeyDigest {
    pub fn of_public_key(key: &RsaPublicKey) -> Self {
        let mut h = Sha256::new();
        h.update(key.n().to_bytes_be());
        h.update(key.e().to_bytes_be());
        let out = h.finalize();
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&out);
        KeyDigest(digest)
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl std::fmt::Display for KeyDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// The server's long-term RSA keypair.
pub struct LongTermKey {
    private: RsaPrivateKey,
    public: RsaPublicKey,
    digest: KeyDigest,
}

impl LongTermKey {
    pub fn load(path: &Path) -> Result<Self> {
        let pem = std::fs::read_to_string(path)
            .with_context(|| format!("read long-term key {}", path.display()))?;
        let private = RsaPrivateKey::from_pkcs1_pem(&pem)
            .with_context(|| format!("parse PKCS1 RSA private key {}", path.display()))?;
        let public = RsaPublicKey::from(&private);
        let digest = KeyDigest::of_public_key(&public);
        Ok(Self {
            private,
            public,
            digest,
        })
    }

    pub fn public(&self) -> &RsaPublicKey {
        &self.public
    }

    pub fn private(&self) -> &RsaPrivateKey {
        &self.private
    }

    pub fn digest(&self) -> &KeyDigest {
        &self.digest
    }

    /// RSA-decrypt a ciphertext produced by a peer using our public key
    /// (PKCS#1 v1.5 padding, matching the legacy wire format).
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.private
            .decrypt(Pkcs1v15Encrypt, ciphertext)
            .context("RSA decrypt failed")
    }
}

impl Drop for LongTermKey {
    fn drop(&mut self) {
        // RsaPrivateKey has no public byte buffer to zero directly; the
        // digest (public, non-secret) doesn't need zeroing but we keep the
        // pattern the rest of the crate follows for key-bearing structs.
        let mut d = self.digest.0;
        d.zeroize();
    }
}

/// RSA-encrypt `plaintext` for `peer_key` (PKCS#1 v1.5), used for the
/// server's own challenge to the client (§4.6 step 6) and for the outbound
/// session key (§4.6 step 10, from the client's perspective — kept here
/// for symmetry and tests).
pub fn encrypt_for(peer_key: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut rng = rand::rngs::OsRng;
    peer_key
        .encrypt(&mut rng, Pkcs1v15Encrypt, plaintext)
        .context("RSA encrypt failed")
}

/// Decode a public key transmitted as two length-prefixed big-integers
/// (modulus `n`, then exponent `e`) per §4.6 step 3.
pub fn decode_mpi_public_key(n_bytes: &[u8], e_bytes: &[u8]) -> Result<RsaPublicKey> {
    let n = rsa::BigUint::from_bytes_be(n_bytes);
    let e = rsa::BigUint::from_bytes_be(e_bytes);
    RsaPublicKey::new(n, e).context("invalid client public key (n, e)")
}

/// Encode a public key as the two big-integers the wire format expects.
pub fn encode_mpi_public_key(key: &RsaPublicKey) -> (Vec<u8>, Vec<u8>) {
    (key.n().to_bytes_be(), key.e().to_bytes_be())
}

/// Parse a PEM public key read directly off the wire for diagnostics/tests.
#[allow(dead_code)]
pub fn parse_public_key_pem(pem: &str) -> Result<RsaPublicKey> {
    RsaPublicKey::from_pkcs1_pem(pem).context("parse PKCS1 RSA public key")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs1::EncodeRsaPrivateKey;

    fn gen_key(bits: usize) -> RsaPrivateKey {
        let mut rng = rand::rngs::OsRng;
        RsaPrivateKey::new(&mut rng, bits).unwrap()
    }

    #[test]
    fn digest_is_stable_for_same_key() {
        let priv_key = gen_key(1024);
        let pub_key = RsaPublicKey::from(&priv_key);
        let d1 = KeyDigest::of_public_key(&pub_key);
        let d2 = KeyDigest::of_public_key(&pub_key);
        assert_eq!(d1.0, d2.0);
    }

    #[test]
    fn digest_differs_across_keys() {
        let k1 = RsaPublicKey::from(&gen_key(1024));
        let k2 = RsaPublicKey::from(&gen_key(1024));
        assert_ne!(KeyDigest::of_public_key(&k1).0, KeyDigest::of_public_key(&k2).0);
    }

    #[test]
    fn mpi_round_trip() {
        let priv_key = gen_key(1024);
        let pub_key = RsaPublicKey::from(&priv_key);
        let (n, e) = encode_mpi_public_key(&pub_key);
        let decoded = decode_mpi_public_key(&n, &e).unwrap();
        assert_eq!(pub_key, decoded);
    }

    #[test]
    fn load_from_pem_file_round_trips_decrypt() {
        let priv_key = gen_key(1024);
        let dir = std::env::temp_dir().join(format!("cmserverd-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("key.pem");
        std::fs::write(&path, priv_key.to_pkcs1_pem(Default::default()).unwrap().as_bytes())
            .unwrap();

        let ltk = LongTermKey::load(&path).unwrap();
        let ct = encrypt_for(ltk.public(), b"hello").unwrap();
        let pt = ltk.decrypt(&ct).unwrap();
        assert_eq!(pt, b"hello");
    }
}
