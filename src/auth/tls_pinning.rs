//! TLS-variant authentication (§4.2, §4.6 note): the handshake itself
//! accepts any certificate (`crypto::tls::AcceptAnyCert`); trust is decided
//! here, after the handshake completes, by comparing the peer's
//! certificate digest against the pinning store — the same trust-on-first-
//! use policy the legacy RSA handshake applies to its key digest.

use crate::connection::Connection;
use crate::crypto::pinning::{PinOutcome, PinningStore};
use crate::crypto::tls::digest_of_cert;
use crate::error::{Result, ServerError};
use crate::state::ServerState;
use rustls::pki_types::CertificateDer;

/// Called once the TLS handshake has completed and a peer certificate was
/// presented. Sets `conn.rsa_auth`/`conn.id_verified`/`conn.trust` on
/// success, matching what `auth::legacy::run_sauth_handshake` does for the
/// classic variant (the TLS variant skips `SAUTH` entirely, §6).
pub fn verify_tls_peer(
    conn: &mut Connection,
    peer_cert: &CertificateDer<'_>,
    pinning: &PinningStore,
    state: &ServerState,
) -> Result<()> {
    let digest = digest_of_cert(peer_cert);
    let pin_key = format!("{}@{}", conn.username.as_deref().unwrap_or(""), conn.peer_ip);

    match pinning.check(&pin_key, &digest)? {
        PinOutcome::Matches => {}
        PinOutcome::Mismatch => {
            return Err(ServerError::Identity(format!(
                "TLS peer certificate for {} does not match pinned key",
                pin_key
            )));
        }
        PinOutcome::Unknown => {
            if state.auto_trusts(&conn.peer_ip) {
                pinning.pin(&pin_key, &digest)?;
                conn.trust = true;
            } else {
                return Err(ServerError::Identity(format!(
                    "unknown TLS peer certificate for {} and host not in trust_keys",
                    pin_key
                )));
            }
        }
    }

    conn.key_digest_hex = Some(digest.to_hex());
    conn.set_rsa_auth();
    conn.set_id_verified();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ProtocolVariant, Transport};
    use crate::policy::PolicyFile;
    use std::net::{TcpListener, TcpStream};

    fn dummy_connection() -> Connection {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        Connection::new(Transport::Plain(client), ProtocolVariant::Tls, "10.0.0.9".to_string())
    }

    #[test]
    fn unknown_peer_refused_without_trust() {
        let root = std::env::temp_dir().join(format!("cmserverd-tlspin-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        let pinning = PinningStore::open_or_create(&root).unwrap();
        let state = PolicyFile::default().into_server_state().unwrap();
        let mut conn = dummy_connection();
        let cert = CertificateDer::from(vec![1, 2, 3]);
        assert!(verify_tls_peer(&mut conn, &cert, &pinning, &state).is_err());
    }

    #[test]
    fn unknown_peer_admitted_on_trust_keys() {
        let root = std::env::temp_dir().join(format!("cmserverd-tlspin-trust-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&root);
        let pinning = PinningStore::open_or_create(&root).unwrap();
        let mut file = PolicyFile::default();
        file.hosts.trust_keys.push("10.0.0.9".to_string());
        let state = file.into_server_state().unwrap();
        let mut conn = dummy_connection();
        let cert = CertificateDer::from(vec![1, 2, 3]);
        assert!(verify_tls_peer(&mut conn, &cert, &pinning, &state).is_ok());
        assert!(conn.rsa_auth);
        assert!(conn.trust);
    }
}
