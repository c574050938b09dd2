//! crypto — long-term keypair, digests, session cipher, peer-key pinning,
//! and the TLS context used by the TLS protocol variant.
//!
//! Submodules:
//! - `longterm`  — RSA keypair load, public-key digest (identity).
//! - `cipher`    — session cipher selected by a one-byte tag (§6).
//! - `pinning`   — trust-on-first-use store for `(username, ip, digest)`.
//! - `tls`       — self-signed server context wrapping the long-term key.

pub mod cipher;
pub mod longterm;
pub mod pinning;
pub mod tls;

pub use cipher::{CipherTag, SessionCipher};
pub use longterm::{KeyDigest, LongTermKey};
pub use pinning::PinningStore;
