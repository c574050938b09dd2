//! TLS protocol variant (§4.2, §4.6 TLS branch): a self-signed identity
//! certificate plus a verifier that accepts any chain at the handshake
//! layer and defers trust entirely to application-level pinning
//! (`crypto::pinning`), the same trust-on-first-use model the legacy
//! handshake uses for RSA keys.
//!
//! Builder shape mirrors `follower`'s `tls_wrap_server`/`tls_wrap_client`
//! (load cert/key, build a `rustls::ServerConfig`), generalized to mutual
//! TLS: the client authenticates with its own self-signed cert so the
//! server can pin its public key the same way the legacy handshake pins
//! the RSA key.

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::path::Path;
use std::sync::Arc;

use crate::crypto::longterm::KeyDigest;
use crate::error::{Result, ServerError};

fn io_err(context: &str, e: impl std::fmt::Display) -> ServerError {
    ServerError::Resource(format!("{}: {}", context, e))
}

/// A self-signed certificate/key pair identifying this host's TLS endpoint.
pub struct TlsIdentity {
    pub cert_der: CertificateDer<'static>,
    key_der_bytes: Vec<u8>,
}

impl TlsIdentity {
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der_bytes.clone()))
    }

    /// Digest of this identity's certificate, used as the local counterpart
    /// to what a peer pins for us.
    pub fn digest(&self) -> KeyDigest {
        digest_of_cert(&self.cert_der)
    }
}

/// Load a previously generated identity from `state_dir`, or generate and
/// persist a new one (self-signed, long-lived) if none exists yet.
pub fn load_or_generate_identity(state_dir: &Path) -> Result<TlsIdentity> {
    std::fs::create_dir_all(state_dir).map_err(|e| io_err("create state dir", e))?;
    let cert_path = state_dir.join("tls_identity.cert.der");
    let key_path = state_dir.join("tls_identity.key.der");

    if cert_path.exists() && key_path.exists() {
        let cert_bytes = std::fs::read(&cert_path).map_err(|e| io_err("read tls cert", e))?;
        let key_bytes = std::fs::read(&key_path).map_err(|e| io_err("read tls key", e))?;
        return Ok(TlsIdentity {
            cert_der: CertificateDer::from(cert_bytes),
            key_der_bytes: key_bytes,
        });
    }

    let params = rcgen::CertificateParams::new(vec!["cmserverd".to_string()])
        .map_err(|e| io_err("build certificate params", e))?;
    let key_pair = rcgen::KeyPair::generate().map_err(|e| io_err("generate tls keypair", e))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| io_err("self-sign tls certificate", e))?;

    let cert_bytes = cert.der().to_vec();
    let key_bytes = key_pair.serialize_der();

    std::fs::write(&cert_path, &cert_bytes).map_err(|e| io_err("write tls cert", e))?;
    std::fs::write(&key_path, &key_bytes).map_err(|e| io_err("write tls key", e))?;

    Ok(TlsIdentity {
        cert_der: CertificateDer::from(cert_bytes),
        key_der_bytes: key_bytes,
    })
}

/// SHA-256 over the certificate's DER bytes, used as the pinnable identity
/// for the TLS variant (the analogue of `KeyDigest::of_public_key` for the
/// legacy RSA variant).
pub fn digest_of_cert(cert: &CertificateDer<'_>) -> KeyDigest {
    use sha2::{Digest, Sha256};
    let mut h = Sha256::new();
    h.update(cert.as_ref());
    let out = h.finalize();
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&out);
    KeyDigest(digest)
}

/// Accepts any certificate chain at the TLS layer. Trust is decided
/// afterward by the dispatcher comparing `digest_of_cert` of the peer's
/// leaf certificate against the pinning store.
#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
        .map(|_| rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
        .map(|_| rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

impl rustls::server::danger::ClientCertVerifier for AcceptAnyCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
        .map(|_| rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &rustls::crypto::ring::default_provider().signature_verification_algorithms,
        )
        .map(|_| rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Build the server-side TLS config: presents `identity`, requires (and
/// blindly accepts) a client certificate.
pub fn build_server_config(identity: &TlsIdentity) -> Result<Arc<rustls::ServerConfig>> {
    let cfg = rustls::ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(AcceptAnyCert))
        .with_single_cert(vec![identity.cert_der.clone()], identity.private_key())
        .map_err(|e| io_err("build tls server config", e))?;
    Ok(Arc::new(cfg))
}

/// Build the client-side TLS config used when this daemon itself opens an
/// outbound managed connection (agent pull mode is out of scope here, but
/// `runner`/tests exercise this path against a local listener).
pub fn build_client_config(identity: &TlsIdentity) -> Result<Arc<rustls::ClientConfig>> {
    let cfg = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
        .with_client_auth_cert(vec![identity.cert_der.clone()], identity.private_key())
        .map_err(|e| io_err("build tls client config", e))?;
    Ok(Arc::new(cfg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_persists_identity() {
        let dir = std::env::temp_dir().join(format!("cmserverd-tls-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let a = load_or_generate_identity(&dir).unwrap();
        let b = load_or_generate_identity(&dir).unwrap();
        assert_eq!(a.digest().0, b.digest().0);
    }

    #[test]
    fn digest_changes_with_cert_bytes() {
        let mut der_a = vec![1, 2, 3];
        let mut der_b = vec![1, 2, 4];
        let a = digest_of_cert(&CertificateDer::from(std::mem::take(&mut der_a)));
        let b = digest_of_cert(&CertificateDer::from(std::mem::take(&mut der_b)));
        assert_ne!(a.0, b.0);
    }
}
