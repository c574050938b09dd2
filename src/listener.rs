//! Accept loop (§4.4, §5). One detached worker thread per accepted
//! connection, bounded stack, per-IP admission checks before the worker is
//! even spawned. Shape follows `follower`'s `server_loop`/`handle_session`
//! split, generalized from "one TLS mode decided at startup" to "admission
//! filter, then protocol-specific handshake, then the shared dispatcher".

use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{info, warn};

use crate::auth;
use crate::callback::CallbackQueue;
use crate::config::ServerConfig;
use crate::connection::{Connection, ProtocolVariant, Transport};
use crate::consts::{APOPTOSIS_THRESHOLD, LIVE_CONN_PURGE_SECS, WORKER_STACK_SIZE};
use crate::crypto::longterm::LongTermKey;
use crate::crypto::pinning::PinningStore;
use crate::crypto::tls::TlsIdentity;
use crate::dispatch;
use crate::reload::ReloadBarrier;
use crate::state::{ServerState, StateHandle};
use crate::store::ContextStore;

fn now_epoch() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Returns `false` if the connection should be refused/closed immediately
/// without ever reaching a worker (the only silent-drop case §7 allows).
fn admit(state: &ServerState, ip: &str) -> bool {
    if state.is_attacker(ip) {
        crate::metrics::record_connection_refused();
        return false;
    }
    if !state.is_allowed_by_whitelist(ip) {
        crate::metrics::record_connection_refused();
        return false;
    }
    let mut live = state.live_connections.lock().unwrap();
    if live.contains_key(ip) && !state.allows_multi_conn(ip) {
        drop(live);
        crate::metrics::record_connection_refused();
        return false;
    }
    live.insert(ip.to_string(), now_epoch());
    crate::metrics::record_connection_accepted();
    true
}

fn purge_live_connections(state: &ServerState) {
    let mut live = state.live_connections.lock().unwrap();
    let now = now_epoch();
    live.retain(|_, last_seen| now.saturating_sub(*last_seen) < LIVE_CONN_PURGE_SECS);
}

fn release_connection(state: &ServerState, ip: &str) {
    let mut live = state.live_connections.lock().unwrap();
    live.remove(ip);
}

/// Everything a worker thread needs, bundled so the accept loops stay
/// readable. Cheap to clone: every field is an `Arc`.
#[derive(Clone)]
pub struct Shared {
    pub state: Arc<StateHandle>,
    pub pinning: Arc<PinningStore>,
    pub context_store: Arc<ContextStore>,
    pub barrier: Arc<ReloadBarrier>,
    pub rejection_streak: Arc<AtomicU64>,
    pub callback_queue: Arc<CallbackQueue>,
}

/// Drain any SCALLBACK jobs queued since the last drain and log them (§4.8).
/// Called once per accept-loop iteration, symmetric to `purge_live_connections`.
fn drain_callback_queue(queue: &CallbackQueue) {
    for job in queue.drain() {
        info!("callback collect-calls from {}: {}", job.peer_ip, job.collect_calls);
        crate::metrics::record_callback_processed();
    }
}

/// Classic-protocol listener: plain TCP, `SAUTH` handshake in-band.
pub fn run_classic(
    cfg: &ServerConfig,
    shared: Shared,
    ltk: Arc<LongTermKey>,
    terminate: Arc<AtomicBool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(cfg.addr())?;
    listener.set_nonblocking(true)?;
    info!("classic listener bound on {}", cfg.addr());

    while !terminate.load(Ordering::Relaxed) {
        let snapshot = shared.state.load();
        purge_live_connections(&snapshot);
        drain_callback_queue(&shared.callback_queue);
        match listener.accept() {
            Ok((stream, peer)) => {
                let ip = normalize_peer_ip(&peer);
                if !admit(&snapshot, &ip) {
                    continue; // silent drop, per §4.4/§7
                }
                let _ = stream.set_nonblocking(false);
                let _ = stream.set_nodelay(true);
                let _ = crate::framing::apply_recv_timeout(&stream, cfg.recv_timeout_secs);

                let transport = Transport::Plain(stream);
                let shared = shared.clone();
                let ltk = ltk.clone();
                spawn_worker(transport, ProtocolVariant::Classic, ip, snapshot.clone(), shared, Some(ltk));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(200));
            }
            Err(e) => {
                warn!("accept failed: {}", e);
            }
        }
    }
    Ok(())
}

/// TLS-protocol listener: the handshake itself is mutual-and-unchecked;
/// trust is decided post-handshake by `auth::tls_pinning`.
pub fn run_tls(
    cfg: &ServerConfig,
    shared: Shared,
    tls_identity: Arc<TlsIdentity>,
    terminate: Arc<AtomicBool>,
    tls_port: u16,
) -> std::io::Result<()> {
    let bind = format!("{}:{}", cfg.bind, tls_port);
    let listener = TcpListener::bind(&bind)?;
    listener.set_nonblocking(true)?;
    info!("tls listener bound on {}", bind);

    let server_config = crate::crypto::tls::build_server_config(&tls_identity)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

    while !terminate.load(Ordering::Relaxed) {
        let snapshot = shared.state.load();
        purge_live_connections(&snapshot);
        drain_callback_queue(&shared.callback_queue);
        match listener.accept() {
            Ok((stream, peer)) => {
                let ip = normalize_peer_ip(&peer);
                if !admit(&snapshot, &ip) {
                    continue;
                }
                let _ = stream.set_nonblocking(false);
                let _ = stream.set_nodelay(true);
                let _ = crate::framing::apply_recv_timeout(&stream, cfg.recv_timeout_secs);

                let conn = match rustls::ServerConnection::new(server_config.clone()) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("tls connection setup failed for {}: {}", ip, e);
                        release_connection(&snapshot, &ip);
                        continue;
                    }
                };
                let tls_stream = rustls::StreamOwned::new(conn, stream);
                let transport = Transport::Tls(Box::new(tls_stream));

                let shared = shared.clone();
                spawn_worker(transport, ProtocolVariant::Tls, ip, snapshot.clone(), shared, None);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(200));
            }
            Err(e) => {
                warn!("tls accept failed: {}", e);
            }
        }
    }
    Ok(())
}

/// `state` is the snapshot captured by the accept loop at admission time; the
/// worker keeps using it for its whole lifetime and never re-reads the
/// `StateHandle`, even if a reload lands mid-connection.
fn spawn_worker(
    transport: Transport,
    variant: ProtocolVariant,
    ip: String,
    state: Arc<ServerState>,
    shared: Shared,
    ltk: Option<Arc<LongTermKey>>,
) {
    let builder = thread::Builder::new().stack_size(WORKER_STACK_SIZE);
    let ip_for_err = ip.clone();
    let state_for_err = state.clone();

    let result = builder.spawn(move || {
        let guard = shared.barrier.enter();
        if shared.barrier.active_count() as usize > state.max_workers.unwrap_or(usize::MAX) {
            let streak = shared.rejection_streak.fetch_add(1, Ordering::Relaxed) + 1;
            if streak >= APOPTOSIS_THRESHOLD {
                warn!("apoptosis: {} consecutive capacity rejections, exiting", streak);
                crate::metrics::record_apoptosis();
                std::process::exit(1);
            }
            drop(guard);
            release_connection(&state, &ip);
            return;
        }
        shared.rejection_streak.store(0, Ordering::Relaxed);

        let mut conn = Connection::new(transport, variant, ip.clone());
        if variant == ProtocolVariant::Tls {
            if let Err(e) = authenticate_tls(&mut conn, &shared.pinning, &state) {
                warn!("tls peer rejected for {}: {}", ip, e);
                drop(guard);
                release_connection(&state, &ip);
                return;
            }
        }

        match ltk.as_deref() {
            Some(ltk) => handle_connection(&mut conn, &shared, &state, ltk),
            None => handle_connection_no_legacy_auth(&mut conn, &shared, &state),
        }

        drop(guard);
        release_connection(&state, &ip);
    });

    if let Err(e) = result {
        warn!("failed to spawn worker for {}: {}", ip_for_err, e);
        release_connection(&state_for_err, &ip_for_err);
    }
}

fn authenticate_tls(conn: &mut Connection, pinning: &PinningStore, state: &ServerState) -> Result<(), String> {
    let peer_cert = match &conn.transport {
        Transport::Tls(stream) => stream.conn.peer_certificates().and_then(|certs| certs.first().cloned()),
        Transport::Plain(_) => None,
    };
    let cert = peer_cert.ok_or_else(|| "no peer certificate presented".to_string())?;
    auth::verify_tls_peer(conn, &cert, pinning, state).map_err(|e| e.to_string())
}

fn handle_connection(conn: &mut Connection, shared: &Shared, state: &ServerState, ltk: &LongTermKey) {
    run_request_loop(conn, shared, state, Some(ltk));
}

fn handle_connection_no_legacy_auth(conn: &mut Connection, shared: &Shared, state: &ServerState) {
    run_request_loop(conn, shared, state, None);
}

fn run_request_loop(conn: &mut Connection, shared: &Shared, state: &ServerState, ltk: Option<&LongTermKey>) {
    loop {
        let frame = match conn.read_frame() {
            Ok(f) => f,
            Err(_) => break,
        };
        let line = match std::str::from_utf8(&frame.payload) {
            Ok(s) => s.trim_end_matches(['\r', '\n']).to_string(),
            Err(_) => break,
        };
        if line.is_empty() {
            continue;
        }
        let verb = line.split_whitespace().next().unwrap_or("").to_string();

        if verb == "SAUTH" {
            match ltk {
                Some(ltk) => {
                    if let Err(e) = auth::run_sauth_handshake(conn, ltk, &shared.pinning, state) {
                        warn!("SAUTH failed for {}: {}", conn.peer_ip, e);
                        crate::metrics::record_sauth_failure();
                        break;
                    }
                    crate::metrics::record_sauth_success();
                }
                None => {
                    let _ = conn.write_line("BAD: SAUTH not applicable on an already-authenticated TLS session");
                    break;
                }
            }
            continue;
        }

        match dispatch::dispatch(conn, &line, state, &shared.context_store, &shared.barrier, &shared.callback_queue) {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                warn!("connection from {} torn down: {}", conn.peer_ip, e);
                break;
            }
            Err(_) => {
                // Request-recoverable: a refusal frame was already written.
            }
        }

        if verb == "VERSION" || verb == "EXEC" {
            break;
        }
    }
}

fn normalize_peer_ip(addr: &std::net::SocketAddr) -> String {
    match addr.ip() {
        std::net::IpAddr::V6(v6) => v6.to_ipv4_mapped().map(|v4| v4.to_string()).unwrap_or_else(|| v6.to_string()),
        std::net::IpAddr::V4(v4) => v4.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_ipv4_mapped_ipv6() {
        let addr: std::net::SocketAddr = "[::ffff:10.0.0.5]:1234".parse().unwrap();
        assert_eq!(normalize_peer_ip(&addr), "10.0.0.5");
    }

    #[test]
    fn normalizes_plain_ipv4() {
        let addr: std::net::SocketAddr = "10.0.0.9:1234".parse().unwrap();
        assert_eq!(normalize_peer_ip(&addr), "10.0.0.9");
    }
}
