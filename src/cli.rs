//! CLI entry point: flags override config-file values, which override
//! environment defaults (the same precedence `follower`'s `build_runtime`
//! uses).

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

use crate::config::ServerConfig;

#[derive(Parser, Debug)]
#[command(
    name = "cmserverd",
    version,
    about = "Configuration-management file-and-command server daemon"
)]
pub struct Cli {
    /// Declarative access-control policy file (TOML).
    #[arg(long)]
    pub policy_file: PathBuf,

    /// Optional daemon config file (TOML). CLI flags override config values.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Bind address.
    #[arg(long)]
    pub bind: Option<String>,

    /// Listen port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Maximum concurrent worker threads.
    #[arg(long)]
    pub max_workers: Option<usize>,

    /// Per-receive timeout, seconds.
    #[arg(long)]
    pub recv_timeout_secs: Option<u64>,

    /// Long-term RSA private key (PEM, PKCS#8), used for the legacy
    /// handshake and to derive the TLS self-signed certificate.
    #[arg(long)]
    pub key_file: PathBuf,

    /// Directory backing the peer-key pinning store and context store.
    #[arg(long)]
    pub state_dir: PathBuf,

    /// Disable the TLS listener entirely (classic protocol only).
    #[arg(long, default_value_t = false)]
    pub no_tls: bool,

    /// Address for the Prometheus metrics/health exporter.
    #[arg(long)]
    pub metrics_addr: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    bind: Option<String>,
    port: Option<u16>,
    max_workers: Option<usize>,
    recv_timeout_secs: Option<u64>,
}

fn pick<T>(cli: Option<T>, cfg: Option<T>, default: T) -> T {
    cli.or(cfg).unwrap_or(default)
}

/// Merge CLI flags, an optional TOML config file, and environment defaults
/// into one effective `ServerConfig`.
pub fn build_config(args: &Cli) -> Result<ServerConfig> {
    let file_cfg = if let Some(p) = &args.config {
        let s = std::fs::read_to_string(p)
            .with_context(|| format!("read config {}", p.display()))?;
        toml::from_str::<FileConfig>(&s).context("parse TOML config")?
    } else {
        FileConfig::default()
    };

    let base = ServerConfig::from_env();
    Ok(ServerConfig {
        bind: pick(args.bind.clone(), file_cfg.bind, base.bind),
        port: pick(args.port, file_cfg.port, base.port),
        max_workers: pick(args.max_workers, file_cfg.max_workers, base.max_workers),
        recv_timeout_secs: pick(
            args.recv_timeout_secs,
            file_cfg.recv_timeout_secs,
            base.recv_timeout_secs,
        ),
        tls_min_version: base.tls_min_version,
    })
}
