//! Authentication state machines: the legacy four-way RSA challenge
//! (`legacy`, §4.6) and the post-handshake pinning check the TLS variant
//! uses instead (`tls_pinning`).

pub mod legacy;
pub mod tls_pinning;

pub use legacy::run_sauth_handshake;
pub use tls_pinning::verify_tls_peer;
