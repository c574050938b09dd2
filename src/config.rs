//! Centralized runtime configuration and builder for cmserverd.
//!
//! Goals:
//! - Single place to collect tunables instead of scattering env lookups.
//! - `ServerConfig::from_env()` reads env-var overrides; CLI flags override
//!   those in turn (see `cli.rs`).

use std::fmt;

/// Top-level runtime configuration for the daemon.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address to bind the listener to.
    /// Env: CM_BIND (default "0.0.0.0")
    pub bind: String,

    /// TCP port to listen on.
    /// Env: CM_PORT (default consts::DEFAULT_PORT)
    pub port: u16,

    /// Maximum concurrent worker threads.
    /// Env: CM_MAX_WORKERS (default 64)
    pub max_workers: usize,

    /// Per-receive timeout, seconds.
    /// Env: CM_RECV_TIMEOUT_SECS (default consts::DEFAULT_RECV_TIMEOUT_SECS)
    pub recv_timeout_secs: u64,

    /// Minimum TLS protocol version accepted ("1.2" or "1.3").
    /// Env: CM_TLS_MIN_VERSION (default "1.2")
    pub tls_min_version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: crate::consts::DEFAULT_PORT,
            max_workers: 64,
            recv_timeout_secs: crate::consts::DEFAULT_RECV_TIMEOUT_SECS,
            tls_min_version: "1.2".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("CM_BIND") {
            cfg.bind = v;
        }
        if let Ok(v) = std::env::var("CM_PORT") {
            if let Ok(n) = v.trim().parse::<u16>() {
                cfg.port = n;
            }
        }
        if let Ok(v) = std::env::var("CM_MAX_WORKERS") {
            if let Ok(n) = v.trim().parse::<usize>() {
                cfg.max_workers = n;
            }
        }
        if let Ok(v) = std::env::var("CM_RECV_TIMEOUT_SECS") {
            if let Ok(n) = v.trim().parse::<u64>() {
                cfg.recv_timeout_secs = n;
            }
        }
        if let Ok(v) = std::env::var("CM_TLS_MIN_VERSION") {
            cfg.tls_min_version = v;
        }

        cfg
    }

    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.bind = bind.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_max_workers(mut self, n: usize) -> Self {
        self.max_workers = n;
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

impl fmt::Display for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ServerConfig {{ addr: {}, max_workers: {}, recv_timeout_secs: {}, tls_min_version: {} }}",
            self.addr(),
            self.max_workers,
            self.recv_timeout_secs,
            self.tls_min_version,
        )
    }
}
