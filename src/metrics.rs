//! Prometheus-text metrics/health exporter (§1 ambient stack), embedded as
//! an in-process thread rather than a separate binary the way the teacher's
//! `bin/quiverdb_metrics.rs` ships it as a standalone process — this daemon
//! is the one long-lived process, so the exporter runs alongside the
//! listeners instead of polling a DB directory from outside.

use std::sync::atomic::{AtomicU64, Ordering};

use log::{error, info};
use tiny_http::{Header, Response, Server};

static CONNECTIONS_ACCEPTED: AtomicU64 = AtomicU64::new(0);
static CONNECTIONS_REFUSED: AtomicU64 = AtomicU64::new(0);
static SAUTH_SUCCESSES: AtomicU64 = AtomicU64::new(0);
static SAUTH_FAILURES: AtomicU64 = AtomicU64::new(0);
static TLS_PIN_MISMATCHES: AtomicU64 = AtomicU64::new(0);
static GET_BYTES_SENT: AtomicU64 = AtomicU64::new(0);
static EXEC_INVOCATIONS: AtomicU64 = AtomicU64::new(0);
static EXEC_REFUSALS: AtomicU64 = AtomicU64::new(0);
static APOPTOSIS_EVENTS: AtomicU64 = AtomicU64::new(0);
static CALLBACKS_PROCESSED: AtomicU64 = AtomicU64::new(0);
static RELOADS_APPLIED: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub connections_refused: u64,
    pub sauth_successes: u64,
    pub sauth_failures: u64,
    pub tls_pin_mismatches: u64,
    pub get_bytes_sent: u64,
    pub exec_invocations: u64,
    pub exec_refusals: u64,
    pub apoptosis_events: u64,
    pub callbacks_processed: u64,
    pub reloads_applied: u64,
}

pub fn record_connection_accepted() {
    CONNECTIONS_ACCEPTED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_connection_refused() {
    CONNECTIONS_REFUSED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_sauth_success() {
    SAUTH_SUCCESSES.fetch_add(1, Ordering::Relaxed);
}
pub fn record_sauth_failure() {
    SAUTH_FAILURES.fetch_add(1, Ordering::Relaxed);
}
pub fn record_tls_pin_mismatch() {
    TLS_PIN_MISMATCHES.fetch_add(1, Ordering::Relaxed);
}
pub fn record_get_bytes_sent(n: u64) {
    GET_BYTES_SENT.fetch_add(n, Ordering::Relaxed);
}
pub fn record_exec_invocation() {
    EXEC_INVOCATIONS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_exec_refusal() {
    EXEC_REFUSALS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_apoptosis() {
    APOPTOSIS_EVENTS.fetch_add(1, Ordering::Relaxed);
}
pub fn record_callback_processed() {
    CALLBACKS_PROCESSED.fetch_add(1, Ordering::Relaxed);
}
pub fn record_reload_applied() {
    RELOADS_APPLIED.fetch_add(1, Ordering::Relaxed);
}

pub fn snapshot() -> MetricsSnapshot {
    MetricsSnapshot {
        connections_accepted: CONNECTIONS_ACCEPTED.load(Ordering::Relaxed),
        connections_refused: CONNECTIONS_REFUSED.load(Ordering::Relaxed),
        sauth_successes: SAUTH_SUCCESSES.load(Ordering::Relaxed),
        sauth_failures: SAUTH_FAILURES.load(Ordering::Relaxed),
        tls_pin_mismatches: TLS_PIN_MISMATCHES.load(Ordering::Relaxed),
        get_bytes_sent: GET_BYTES_SENT.load(Ordering::Relaxed),
        exec_invocations: EXEC_INVOCATIONS.load(Ordering::Relaxed),
        exec_refusals: EXEC_REFUSALS.load(Ordering::Relaxed),
        apoptosis_events: APOPTOSIS_EVENTS.load(Ordering::Relaxed),
        callbacks_processed: CALLBACKS_PROCESSED.load(Ordering::Relaxed),
        reloads_applied: RELOADS_APPLIED.load(Ordering::Relaxed),
    }
}

fn build_metrics_body() -> String {
    let m = snapshot();
    let mut out = String::new();
    let ver = env!("CARGO_PKG_VERSION");

    out.push_str("# HELP cmserverd_build_info Build info.\n");
    out.push_str("# TYPE cmserverd_build_info gauge\n");
    out.push_str(&format!("cmserverd_build_info{{version=\"{}\"}} 1\n", ver));

    out.push_str("# HELP cmserverd_connections_accepted_total Connections admitted past per-IP filtering.\n");
    out.push_str("# TYPE cmserverd_connections_accepted_total counter\n");
    out.push_str(&format!("cmserverd_connections_accepted_total {}\n", m.connections_accepted));

    out.push_str("# HELP cmserverd_connections_refused_total Connections refused at admission (attacker/whitelist/multi-conn).\n");
    out.push_str("# TYPE cmserverd_connections_refused_total counter\n");
    out.push_str(&format!("cmserverd_connections_refused_total {}\n", m.connections_refused));

    out.push_str("# HELP cmserverd_sauth_successes_total Completed SAUTH handshakes.\n");
    out.push_str("# TYPE cmserverd_sauth_successes_total counter\n");
    out.push_str(&format!("cmserverd_sauth_successes_total {}\n", m.sauth_successes));

    out.push_str("# HELP cmserverd_sauth_failures_total Failed SAUTH handshakes.\n");
    out.push_str("# TYPE cmserverd_sauth_failures_total counter\n");
    out.push_str(&format!("cmserverd_sauth_failures_total {}\n", m.sauth_failures));

    out.push_str("# HELP cmserverd_tls_pin_mismatches_total TLS peer certificates that failed pinning.\n");
    out.push_str("# TYPE cmserverd_tls_pin_mismatches_total counter\n");
    out.push_str(&format!("cmserverd_tls_pin_mismatches_total {}\n", m.tls_pin_mismatches));

    out.push_str("# HELP cmserverd_get_bytes_sent_total Bytes served by GET/SGET.\n");
    out.push_str("# TYPE cmserverd_get_bytes_sent_total counter\n");
    out.push_str(&format!("cmserverd_get_bytes_sent_total {}\n", m.get_bytes_sent));

    out.push_str("# HELP cmserverd_exec_invocations_total Successful EXEC invocations.\n");
    out.push_str("# TYPE cmserverd_exec_invocations_total counter\n");
    out.push_str(&format!("cmserverd_exec_invocations_total {}\n", m.exec_invocations));

    out.push_str("# HELP cmserverd_exec_refusals_total EXEC requests refused (auth/role/capacity).\n");
    out.push_str("# TYPE cmserverd_exec_refusals_total counter\n");
    out.push_str(&format!("cmserverd_exec_refusals_total {}\n", m.exec_refusals));

    out.push_str("# HELP cmserverd_apoptosis_events_total Worker self-terminations due to sustained capacity rejection.\n");
    out.push_str("# TYPE cmserverd_apoptosis_events_total counter\n");
    out.push_str(&format!("cmserverd_apoptosis_events_total {}\n", m.apoptosis_events));

    out.push_str("# HELP cmserverd_callbacks_processed_total SCALLBACK jobs drained from the call-collect queue.\n");
    out.push_str("# TYPE cmserverd_callbacks_processed_total counter\n");
    out.push_str(&format!("cmserverd_callbacks_processed_total {}\n", m.callbacks_processed));

    out.push_str("# HELP cmserverd_reloads_applied_total Policy reloads applied at worker quiescence.\n");
    out.push_str("# TYPE cmserverd_reloads_applied_total counter\n");
    out.push_str(&format!("cmserverd_reloads_applied_total {}\n", m.reloads_applied));

    out
}

/// Run the exporter loop on `addr` until the process exits. Intended to be
/// spawned on its own thread from `main`; errors binding the listener are
/// fatal to the thread (logged, then it returns).
pub fn run_exporter(addr: &str) {
    let server = match Server::http(addr) {
        Ok(s) => s,
        Err(e) => {
            error!("metrics exporter failed to bind {}: {}", addr, e);
            return;
        }
    };
    info!("metrics exporter listening on {}", addr);

    for rq in server.incoming_requests() {
        let url = rq.url().to_string();
        let method = rq.method().as_str().to_string();

        if method == "GET" && (url == "/" || url == "/health" || url == "/ready") {
            let _ = rq.respond(Response::from_string("OK\n").with_status_code(200));
            continue;
        }

        if method == "GET" && url == "/metrics" {
            let body = build_metrics_body();
            let mut resp = Response::from_string(body);
            if let Ok(ct) = Header::from_bytes(b"Content-Type", b"text/plain; version=0.0.4") {
                resp.add_header(ct);
            }
            let _ = rq.respond(resp);
            continue;
        }

        let _ = rq.respond(Response::from_string("not found\n").with_status_code(404));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_counters() {
        record_connection_accepted();
        record_sauth_failure();
        let snap = snapshot();
        assert!(snap.connections_accepted >= 1);
        assert!(snap.sauth_failures >= 1);
    }

    #[test]
    fn metrics_body_contains_expected_series() {
        let body = build_metrics_body();
        assert!(body.contains("cmserverd_connections_accepted_total"));
        assert!(body.contains("cmserverd_build_info"));
    }
}
