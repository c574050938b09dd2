use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;
use env_logger::{Builder, Env};
use log::{error, info};

use cmserverd::callback::CallbackQueue;
use cmserverd::cli::{build_config, Cli};
use cmserverd::consts::{RELOAD_BARRIER_TIMEOUT_SECS, RELOAD_POLL_SECS};
use cmserverd::crypto::longterm::LongTermKey;
use cmserverd::crypto::pinning::PinningStore;
use cmserverd::crypto::tls::load_or_generate_identity;
use cmserverd::listener::{self, Shared};
use cmserverd::policy::PolicyFile;
use cmserverd::reload::{self, ReloadBarrier};
use cmserverd::state::StateHandle;
use cmserverd::store::ContextStore;

fn init_logger() {
    Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();
}

fn main() {
    init_logger();

    if let Err(e) = run() {
        error!("{:?}", e);
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args = Cli::parse();
    let cfg = build_config(&args)?;
    info!("starting with {}", cfg);

    let policy = PolicyFile::load(&args.policy_file)?;
    let mut state = policy.into_server_state()?;
    if state.max_workers.is_none() {
        state.max_workers = Some(cfg.max_workers);
    }
    let state = Arc::new(StateHandle::new(state));

    let ltk = Arc::new(LongTermKey::load(&args.key_file)?);
    let pinning = Arc::new(PinningStore::open_or_create(&args.state_dir)?);
    let context_store = Arc::new(ContextStore::open_or_create(&args.state_dir)?);
    let barrier = ReloadBarrier::new();

    let shared = Shared {
        state: state.clone(),
        pinning,
        context_store,
        barrier: barrier.clone(),
        rejection_streak: Arc::new(AtomicU64::new(0)),
        callback_queue: Arc::new(CallbackQueue::new()),
    };

    let terminate = Arc::new(AtomicBool::new(false));
    register_termination_handlers(&terminate)?;

    let mut handles = Vec::new();

    {
        let policy_path = args.policy_file.clone();
        let trigger_path = args.state_dir.join("reload.stamp");
        let state = state.clone();
        let barrier = barrier.clone();
        let terminate = terminate.clone();
        handles.push(thread::spawn(move || {
            reload::run_reload_watcher(
                policy_path,
                trigger_path,
                state,
                barrier,
                Duration::from_secs(RELOAD_POLL_SECS),
                Duration::from_secs(RELOAD_BARRIER_TIMEOUT_SECS),
                terminate,
            );
        }));
    }

    {
        let cfg = cfg.clone();
        let shared = shared.clone();
        let ltk = ltk.clone();
        let terminate = terminate.clone();
        handles.push(thread::spawn(move || {
            if let Err(e) = listener::run_classic(&cfg, shared, ltk, terminate) {
                error!("classic listener exited: {}", e);
            }
        }));
    }

    if !args.no_tls {
        let tls_identity = Arc::new(load_or_generate_identity(&args.state_dir)?);
        let cfg = cfg.clone();
        let shared = shared.clone();
        let terminate = terminate.clone();
        let tls_port = cfg.port + 1;
        handles.push(thread::spawn(move || {
            if let Err(e) = listener::run_tls(&cfg, shared, tls_identity, terminate, tls_port) {
                error!("tls listener exited: {}", e);
            }
        }));
    }

    if let Some(addr) = args.metrics_addr.clone() {
        handles.push(thread::spawn(move || {
            cmserverd::metrics::run_exporter(&addr);
        }));
    }

    for h in handles {
        let _ = h.join();
    }
    Ok(())
}

/// Flip `terminate` on TERM/INT/USR1/USR2 so both accept loops exit their
/// poll loop cleanly instead of being killed mid-connection (§6 signal
/// contract). HUP/PIPE are left at their default disposition deliberately —
/// this daemon has no config-reload-on-HUP convention to honor.
fn register_termination_handlers(terminate: &Arc<AtomicBool>) -> anyhow::Result<()> {
    signal_hook::flag::register(signal_hook::consts::SIGTERM, terminate.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, terminate.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGUSR1, terminate.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGUSR2, terminate.clone())?;
    Ok(())
}
