//! End-to-end dispatcher scenarios over a real loopback socket pair: one
//! thread drives `dispatch` against the server-side `Connection`, the test
//! body plays client, writing/reading frames directly.

use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;

use cmserverd::acl::{AclRule, RuleKind};
use cmserverd::callback::CallbackQueue;
use cmserverd::connection::{Connection, ProtocolVariant, Transport};
use cmserverd::dispatch::dispatch;
use cmserverd::framing::{self, Continuation};
use cmserverd::policy::{HostsSpec, RunSpec};
use cmserverd::reload::ReloadBarrier;
use cmserverd::state::ServerState;
use cmserverd::store::ContextStore;

fn connected_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (server, client)
}

fn tmp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("cmserverd-dispatch-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir.canonicalize().unwrap()
}

fn state_with_path_rule(allowed_dir: &PathBuf) -> ServerState {
    let mut admit = AclRule::new(RuleKind::PathPrefix, allowed_dir.to_str().unwrap()).unwrap();
    admit.allow_addrs.push("127.0.0.1".to_string());

    let mut hosts = HostsSpec::default();
    hosts.allow_users.push("alice".to_string());

    let mut run = RunSpec::default();
    run.max_workers = Some(8);

    ServerState::new(vec![admit], vec![], vec![], vec![], vec![], hosts, run)
}

fn read_reply(client: &mut TcpStream) -> framing::Frame {
    framing::read_frame(client).unwrap()
}

#[test]
fn version_succeeds_without_identity() {
    let (server, mut client) = connected_pair();
    let dir = tmp_dir("version");
    let state = state_with_path_rule(&dir);
    let ctx = ContextStore::open_or_create(&dir).unwrap();
    let barrier = ReloadBarrier::new();
    let cbq = CallbackQueue::new();

    let mut conn = Connection::new(Transport::Plain(server), ProtocolVariant::Classic, "127.0.0.1".to_string());
    dispatch(&mut conn, "VERSION", &state, &ctx, &barrier, &cbq).unwrap();

    let frame = read_reply(&mut client);
    let text = String::from_utf8(frame.payload).unwrap();
    assert!(text.starts_with("OK: cmserverd"));
}

#[test]
fn get_before_cauth_is_refused() {
    let (server, mut client) = connected_pair();
    let dir = tmp_dir("get-no-auth");
    let state = state_with_path_rule(&dir);
    let ctx = ContextStore::open_or_create(&dir).unwrap();
    let barrier = ReloadBarrier::new();
    let cbq = CallbackQueue::new();

    let mut conn = Connection::new(Transport::Plain(server), ProtocolVariant::Classic, "127.0.0.1".to_string());
    let result = dispatch(&mut conn, "GET 2048 /etc/passwd", &state, &ctx, &barrier, &cbq);
    assert!(result.is_err());

    let frame = read_reply(&mut client);
    assert_eq!(frame.payload, cmserverd::consts::FAILED.as_bytes());
}

#[test]
fn cauth_rejects_ip_mismatch() {
    let (server, mut client) = connected_pair();
    let dir = tmp_dir("cauth-mismatch");
    let state = state_with_path_rule(&dir);
    let ctx = ContextStore::open_or_create(&dir).unwrap();
    let barrier = ReloadBarrier::new();
    let cbq = CallbackQueue::new();

    let mut conn = Connection::new(Transport::Plain(server), ProtocolVariant::Classic, "127.0.0.1".to_string());
    let result = dispatch(&mut conn, "CAUTH 10.0.0.9 host1 alice", &state, &ctx, &barrier, &cbq);
    assert!(result.is_err());

    let frame = read_reply(&mut client);
    let text = String::from_utf8(frame.payload).unwrap();
    assert!(text.starts_with("BAD:"));
}

#[test]
fn cauth_then_get_streams_allowed_file() {
    let (server, mut client) = connected_pair();
    let dir = tmp_dir("get-allowed");
    let file_path = dir.join("promises.cf");
    std::fs::write(&file_path, b"body promises {}\n").unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&file_path, std::fs::Permissions::from_mode(0o644)).unwrap();
    }

    let state = state_with_path_rule(&dir);
    let ctx = ContextStore::open_or_create(&dir).unwrap();
    let barrier = ReloadBarrier::new();
    let cbq = CallbackQueue::new();

    let mut conn = Connection::new(Transport::Plain(server), ProtocolVariant::Classic, "127.0.0.1".to_string());
    dispatch(&mut conn, "CAUTH 127.0.0.1 host1 alice", &state, &ctx, &barrier, &cbq).unwrap();
    let _ = read_reply(&mut client);

    conn.set_id_verified();
    let get_line = format!("GET 2048 {}", file_path.display());
    dispatch(&mut conn, &get_line, &state, &ctx, &barrier, &cbq).unwrap();

    let mut collected = Vec::new();
    loop {
        let frame = read_reply(&mut client);
        let done = frame.flag == Continuation::Done;
        collected.extend_from_slice(&frame.payload);
        if done {
            break;
        }
    }
    assert_eq!(collected, b"body promises {}\n");
}

#[test]
fn get_outside_admitted_prefix_is_refused() {
    let (server, mut client) = connected_pair();
    let dir = tmp_dir("get-outside");
    let state = state_with_path_rule(&dir);
    let ctx = ContextStore::open_or_create(&dir).unwrap();
    let barrier = ReloadBarrier::new();
    let cbq = CallbackQueue::new();

    let mut conn = Connection::new(Transport::Plain(server), ProtocolVariant::Classic, "127.0.0.1".to_string());
    conn.set_id_verified();
    let result = dispatch(&mut conn, "GET 2048 /etc/shadow", &state, &ctx, &barrier, &cbq);
    assert!(result.is_err());

    let frame = read_reply(&mut client);
    let text = String::from_utf8(frame.payload).unwrap();
    assert!(text.starts_with("BAD:"));
}

#[test]
fn exec_without_rsa_auth_is_refused() {
    let (server, mut client) = connected_pair();
    let dir = tmp_dir("exec-no-rsa");
    let state = state_with_path_rule(&dir);
    let ctx = ContextStore::open_or_create(&dir).unwrap();
    let barrier = ReloadBarrier::new();
    let cbq = CallbackQueue::new();

    let mut conn = Connection::new(Transport::Plain(server), ProtocolVariant::Classic, "127.0.0.1".to_string());
    conn.set_id_verified();
    conn.username = Some("alice".to_string());

    let result = dispatch(&mut conn, "EXEC --define role1", &state, &ctx, &barrier, &cbq);
    assert!(result.is_err());

    let frame = read_reply(&mut client);
    let text = String::from_utf8(frame.payload).unwrap();
    assert!(text.starts_with("BAD:"));
}

#[test]
fn context_scan_returns_only_matching_and_authorized_classes() {
    let (server, mut client) = connected_pair();
    let dir = tmp_dir("context-scan");
    let mut admit_vars = AclRule::new(RuleKind::ClassPattern, "^linux_.*$").unwrap();
    admit_vars.allow_addrs.push("127.0.0.1".to_string());

    let state = ServerState::new(vec![], vec![], vec![admit_vars], vec![], vec![], HostsSpec::default(), RunSpec::default());
    let ctx = ContextStore::open_or_create(&dir).unwrap();
    ctx.set("linux_x86_64", "true", 3600).unwrap();
    ctx.set("windows_x86_64", "true", 3600).unwrap();
    let barrier = ReloadBarrier::new();
    let cbq = CallbackQueue::new();

    let mut conn = Connection::new(Transport::Plain(server), ProtocolVariant::Classic, "127.0.0.1".to_string());
    conn.set_id_verified();
    dispatch(&mut conn, "CONTEXT .*", &state, &ctx, &barrier, &cbq).unwrap();

    let frame = read_reply(&mut client);
    let text = String::from_utf8_lossy(&frame.payload);
    assert!(text.contains("linux_x86_64"));
    assert!(!text.contains("windows_x86_64"));
}

#[test]
fn unknown_verb_is_rejected() {
    let (server, mut client) = connected_pair();
    let dir = tmp_dir("unknown-verb");
    let state = state_with_path_rule(&dir);
    let ctx = ContextStore::open_or_create(&dir).unwrap();
    let barrier = ReloadBarrier::new();
    let cbq = CallbackQueue::new();

    let mut conn = Connection::new(Transport::Plain(server), ProtocolVariant::Classic, "127.0.0.1".to_string());
    conn.set_id_verified();
    let result = dispatch(&mut conn, "FROBNICATE", &state, &ctx, &barrier, &cbq);
    assert!(result.is_err());

    let frame = read_reply(&mut client);
    assert_eq!(frame.payload, cmserverd::consts::FAILED.as_bytes());
}

#[test]
fn synch_stat_returns_metadata_for_admitted_path() {
    let (server, mut client) = connected_pair();
    let dir = tmp_dir("synch-stat");
    let file_path = dir.join("promises.cf");
    std::fs::write(&file_path, b"body promises {}\n").unwrap();

    let state = state_with_path_rule(&dir);
    let ctx = ContextStore::open_or_create(&dir).unwrap();
    let barrier = ReloadBarrier::new();
    let cbq = CallbackQueue::new();

    let mut conn = Connection::new(Transport::Plain(server), ProtocolVariant::Classic, "127.0.0.1".to_string());
    conn.set_id_verified();
    let line = format!("SYNCH 1700000000 STAT {}", file_path.display());
    dispatch(&mut conn, &line, &state, &ctx, &barrier, &cbq).unwrap();

    let frame = read_reply(&mut client);
    let text = String::from_utf8(frame.payload).unwrap();
    assert!(text.starts_with("OK: size="));
}

#[test]
fn synch_outside_admitted_prefix_is_refused() {
    let (server, mut client) = connected_pair();
    let dir = tmp_dir("synch-outside");
    let state = state_with_path_rule(&dir);
    let ctx = ContextStore::open_or_create(&dir).unwrap();
    let barrier = ReloadBarrier::new();
    let cbq = CallbackQueue::new();

    let mut conn = Connection::new(Transport::Plain(server), ProtocolVariant::Classic, "127.0.0.1".to_string());
    conn.set_id_verified();
    let result = dispatch(&mut conn, "SYNCH 1700000000 STAT /etc/shadow", &state, &ctx, &barrier, &cbq);
    assert!(result.is_err());

    let frame = read_reply(&mut client);
    let text = String::from_utf8(frame.payload).unwrap();
    assert!(text.starts_with("BAD:"));
}

#[test]
fn scallback_enqueues_job_for_the_listener_to_drain() {
    let (server, mut client) = connected_pair();
    let dir = tmp_dir("scallback");
    let state = state_with_path_rule(&dir);
    let ctx = ContextStore::open_or_create(&dir).unwrap();
    let barrier = ReloadBarrier::new();
    let cbq = CallbackQueue::new();

    let mut conn = Connection::new(Transport::Plain(server), ProtocolVariant::Classic, "127.0.0.1".to_string());
    conn.set_id_verified();
    dispatch(&mut conn, "SCALLBACK collect_calls", &state, &ctx, &barrier, &cbq).unwrap();

    let frame = read_reply(&mut client);
    let text = String::from_utf8(frame.payload).unwrap();
    assert_eq!(text, "OK: callback queued");

    assert_eq!(cbq.len(), 1);
    let drained = cbq.drain();
    assert_eq!(drained[0].peer_ip, "127.0.0.1");
    assert_eq!(drained[0].collect_calls, "collect_calls");
    assert!(cbq.is_empty());
}
