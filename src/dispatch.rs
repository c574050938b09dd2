//! Protocol dispatcher (§4.5): parses one request per transaction, checks
//! per-verb preconditions, and routes to a handler. Verb shape mirrors
//! `original_source/cf-serverd/server.c`'s verb table, re-expressed as a
//! Rust `match` instead of a chain of `strncmp`.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use base64::Engine;
use sha2::{Digest, Sha256};

use crate::acl::{self, CallerIdentity};
use crate::callback::CallbackQueue;
use crate::connection::Connection;
use crate::consts::{
    CFD_TERMINATOR, DEFAULT_BLOCK_SIZE, FAILED, LARGE_FILE_THRESHOLD, MAX_PAYLOAD,
    RESTAT_EVERY_LARGE, RESTAT_EVERY_SMALL,
};
use crate::error::{Result, ServerError};
use crate::framing::Continuation;
use crate::reload::ReloadBarrier;
use crate::runner;
use crate::state::ServerState;
use crate::store::ContextStore;

/// Verbs that do not require `id_verified` (§4.5).
fn verb_requires_identity(verb: &str) -> bool {
    !matches!(verb, "CAUTH" | "SAUTH" | "STARTTLS" | "VERSION")
}

fn caller_identity(conn: &Connection) -> CallerIdentity {
    CallerIdentity {
        ip: conn.peer_ip.clone(),
        hostname: conn.hostname.clone(),
        username: conn.username.clone(),
        rsa_auth: conn.rsa_auth,
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    h.finalize().iter().map(|b| format!("{:02x}", b)).collect()
}

/// Split the first whitespace-delimited token (the verb) from the rest of
/// the line.
fn split_verb(line: &str) -> (&str, &str) {
    match line.find(' ') {
        Some(idx) => (&line[..idx], line[idx + 1..].trim_start()),
        None => (line, ""),
    }
}

/// Dispatch a single request line already read off the wire (decrypted, if
/// it was a secure form — callers handle the `S`-prefix ciphertext
/// indirection before calling this). Returns `Ok(())` having already
/// written the reply; `Err` for failures that should tear the connection
/// down (identity/transport/internal, per §7).
pub fn dispatch(
    conn: &mut Connection,
    line: &str,
    state: &ServerState,
    context_store: &ContextStore,
    barrier: &ReloadBarrier,
    callback_queue: &CallbackQueue,
) -> Result<()> {
    let (verb, rest) = split_verb(line);

    if verb_requires_identity(verb) && !conn.id_verified {
        conn.write_line(FAILED)?;
        return Err(ServerError::Authorization(format!("{} before identification", verb)));
    }

    match verb {
        "VERSION" => {
            conn.write_line(&format!("OK: {}", crate::consts::version_string()))
        }
        "CAUTH" => handle_cauth(conn, rest),
        "STARTTLS" => {
            // The TLS variant runs on its own listener/port in this
            // implementation (§6); classic-protocol STARTTLS is
            // acknowledged but does not renegotiate transport mid-stream.
            conn.write_line("BAD: STARTTLS not supported on classic listener, connect to the TLS port instead")
        }
        "GET" => handle_get(conn, rest, state, false),
        "SGET" => handle_get(conn, rest, state, true),
        "OPENDIR" => handle_opendir(conn, rest, state, false),
        "SOPENDIR" => handle_opendir(conn, rest, state, true),
        "SYNCH" => handle_synch(conn, rest, state, false),
        "SSYNCH" => handle_synch(conn, rest, state, true),
        "MD5" => handle_md5(conn, rest, state, false),
        "SMD5" => handle_md5(conn, rest, state, true),
        "VAR" => handle_var(conn, rest, state, false),
        "SVAR" => handle_var(conn, rest, state, true),
        "CONTEXT" => handle_context(conn, rest, state, context_store, false),
        "SCONTEXT" => handle_context(conn, rest, state, context_store, true),
        "QUERY" => handle_query(conn, rest, state, false),
        "SQUERY" => handle_query(conn, rest, state, true),
        "EXEC" => handle_exec(conn, rest, state, barrier),
        "SCALLBACK" => handle_scallback(conn, rest, callback_queue),
        other => {
            conn.write_line(FAILED)?;
            Err(ServerError::Protocol(format!("unknown verb '{}'", other)))
        }
    }
}

fn handle_cauth(conn: &mut Connection, rest: &str) -> Result<()> {
    let mut parts = rest.split_whitespace();
    let ip = parts.next().ok_or_else(|| ServerError::Protocol("CAUTH missing ip".to_string()))?;
    let fqname = parts.next();
    let username = parts.next();

    if ip != conn.peer_ip {
        conn.write_line("BAD: asserted ip does not match peer address")?;
        return Err(ServerError::Identity("CAUTH ip assertion mismatch".to_string()));
    }

    conn.hostname = fqname.map(|s| s.to_string());
    conn.username = username.map(|s| s.to_string());
    conn.write_line("OK: identified, proceed with SAUTH")
}

fn decode_payload<'a>(
    conn: &Connection,
    rest: &'a str,
    secure: bool,
) -> Result<Vec<u8>> {
    if !secure {
        return Ok(rest.as_bytes().to_vec());
    }
    if conn.session_cipher.is_none() {
        return Err(ServerError::Protocol("secure verb used before session key negotiated".to_string()));
    }
    let ciphertext = base64::engine::general_purpose::STANDARD
        .decode(rest.trim())
        .map_err(|_| ServerError::Protocol("malformed base64 in secure payload".to_string()))?;
    conn.decrypt(&ciphertext)
}

fn encode_reply(conn: &Connection, plaintext: &[u8], secure: bool) -> Result<Vec<u8>> {
    if !secure {
        return Ok(plaintext.to_vec());
    }
    conn.encrypt(plaintext)
}

/// `GET size path`; secure form is `SGET ciphertext-len size` followed by a
/// base64 ciphertext blob whose decrypted contents are the path (§4.7, §6).
/// `ciphertext-len` is checked against the bytes actually received before
/// `decrypt` is ever called (§8 boundary property).
fn handle_get(conn: &mut Connection, rest: &str, state: &ServerState, secure: bool) -> Result<()> {
    let (size, path) = if secure {
        let mut parts = rest.splitn(3, ' ');
        let ciphertext_len: usize = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ServerError::Protocol("SGET missing ciphertext-len".to_string()))?;
        let size: usize = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ServerError::Protocol("SGET missing size".to_string()))?;
        let b64 = parts.next().unwrap_or("").trim();

        if conn.session_cipher.is_none() {
            return Err(ServerError::Protocol("secure verb used before session key negotiated".to_string()));
        }
        let ciphertext = base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|_| ServerError::Protocol("malformed base64 in secure payload".to_string()))?;
        if ciphertext.len() != ciphertext_len {
            conn.write_line(FAILED)?;
            return Err(ServerError::Protocol(format!(
                "SGET ciphertext-len {} disagrees with received {} bytes",
                ciphertext_len,
                ciphertext.len()
            )));
        }
        let plaintext = conn.decrypt(&ciphertext)?;
        let path = String::from_utf8(plaintext).map_err(|_| ServerError::Protocol("non-utf8 SGET path".to_string()))?;
        (size, path)
    } else {
        let mut parts = rest.split_whitespace();
        let size: usize = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ServerError::Protocol("GET missing size".to_string()))?;
        let path = parts.next().ok_or_else(|| ServerError::Protocol("GET missing path".to_string()))?.to_string();
        (size, path)
    };
    let path = path.trim().to_string();
    let path = path.as_str();

    if size == 0 || size > MAX_PAYLOAD as usize {
        conn.write_line("BAD: requested block size out of range")?;
        return Err(ServerError::Resource("GET size out of range".to_string()));
    }
    let block_size = size.min(DEFAULT_BLOCK_SIZE as usize);

    let normalized = acl::normalize_path_subject(path);
    let identity = caller_identity(conn);
    let decision = acl::evaluate(&state.admit_paths, &state.deny_paths, &path_str(&normalized), &identity, conn.is_encrypted());
    if !decision.grant {
        conn.write_line("BAD: not authorized for this path")?;
        return Err(ServerError::Authorization(format!("GET refused for {}", path)));
    }

    let mut file = File::open(&normalized).map_err(|e| ServerError::Resource(format!("open {}: {}", path, e)))?;
    let meta = file.metadata().map_err(|e| ServerError::Resource(format!("stat {}: {}", path, e)))?;
    if !transfer_rights_ok(&meta, decision.map_root) {
        conn.write_line("BAD: not authorized for this path")?;
        return Err(ServerError::Authorization(format!("GET transfer rights denied for {}", path)));
    }

    let restat_every = if meta.len() > LARGE_FILE_THRESHOLD { RESTAT_EVERY_LARGE } else { RESTAT_EVERY_SMALL };
    let mut buf = vec![0u8; block_size];
    let mut blocks_sent: u64 = 0;
    loop {
        let n = file.read(&mut buf).map_err(|e| ServerError::Resource(format!("read {}: {}", path, e)))?;
        if n == 0 {
            conn.write_frame(Continuation::Done, &[])?;
            break;
        }
        blocks_sent += 1;
        if blocks_sent % restat_every == 0 {
            let fresh = file.metadata().map_err(|e| ServerError::Resource(format!("restat {}: {}", path, e)))?;
            if fresh.len() != meta.len() {
                conn.write_frame(Continuation::Done, b"source changed, aborting")?;
                return Ok(());
            }
        }
        let out = encode_reply(conn, &buf[..n], secure)?;
        conn.write_frame(Continuation::More, &out)?;
        crate::metrics::record_get_bytes_sent(n as u64);
    }
    Ok(())
}

/// §4.7: grant if `map_root` was set, the file is other-readable, or the
/// server's own effective UID (this implementation does no per-connection
/// setuid, so "caller's effective UID" is the process EUID) owns the file.
fn transfer_rights_ok(meta: &std::fs::Metadata, map_root: bool) -> bool {
    if map_root {
        return true;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        const OTHER_READ: u32 = 0o004;
        if meta.mode() & OTHER_READ != 0 {
            return true;
        }
        meta.uid() == unsafe { libc::geteuid() }
    }
    #[cfg(not(unix))]
    {
        true
    }
}

fn path_str(p: &Path) -> String {
    p.to_string_lossy().into_owned()
}

fn handle_opendir(conn: &mut Connection, rest: &str, state: &ServerState, secure: bool) -> Result<()> {
    let payload = decode_payload(conn, rest, secure)?;
    let path = String::from_utf8(payload).map_err(|_| ServerError::Protocol("non-utf8 OPENDIR payload".to_string()))?;
    let path = path.trim();

    if !path.starts_with('/') {
        conn.write_line("BAD: path must be absolute")?;
        return Err(ServerError::Resource("OPENDIR non-absolute path".to_string()));
    }

    let normalized = acl::normalize_path_subject(path);
    let identity = caller_identity(conn);
    let decision = acl::evaluate(&state.admit_paths, &state.deny_paths, &path_str(&normalized), &identity, conn.is_encrypted());
    if !decision.grant {
        conn.write_line("BAD: not authorized for this path")?;
        return Err(ServerError::Authorization(format!("OPENDIR refused for {}", path)));
    }

    let entries = std::fs::read_dir(&normalized).map_err(|e| ServerError::Resource(format!("readdir {}: {}", path, e)))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ServerError::Resource(format!("readdir entry: {}", e)))?;
        names.push(entry.file_name().to_string_lossy().into_owned());
    }

    let mut packed = Vec::new();
    for name in &names {
        packed.extend_from_slice(name.as_bytes());
        packed.push(0);
    }
    packed.extend_from_slice(CFD_TERMINATOR.as_bytes());

    let out = encode_reply(conn, &packed, secure)?;
    conn.write_frame(Continuation::Done, &out)
}

/// `SYNCH client-epoch STAT path` (§4.5): the client's copy-reconciliation
/// stat probe, answered after the same ACL check `GET`/`OPENDIR` apply.
/// `client-epoch` is accepted but not otherwise interpreted — this
/// implementation always returns the server's current metadata rather than
/// a delta against the client's last-known epoch.
fn handle_synch(conn: &mut Connection, rest: &str, state: &ServerState, secure: bool) -> Result<()> {
    let payload = decode_payload(conn, rest, secure)?;
    let text = String::from_utf8(payload).map_err(|_| ServerError::Protocol("non-utf8 SYNCH payload".to_string()))?;
    let mut parts = text.split_whitespace();
    let _client_epoch = parts.next().ok_or_else(|| ServerError::Protocol("SYNCH missing client-epoch".to_string()))?;
    let keyword = parts.next().ok_or_else(|| ServerError::Protocol("SYNCH missing STAT keyword".to_string()))?;
    if keyword != "STAT" {
        conn.write_line("BAD: unsupported SYNCH operation")?;
        return Err(ServerError::Protocol(format!("unsupported SYNCH operation '{}'", keyword)));
    }
    let path = parts.next().ok_or_else(|| ServerError::Protocol("SYNCH missing path".to_string()))?;

    let normalized = acl::normalize_path_subject(path);
    let identity = caller_identity(conn);
    let decision = acl::evaluate(&state.admit_paths, &state.deny_paths, &path_str(&normalized), &identity, conn.is_encrypted());
    if !decision.grant {
        conn.write_line("BAD: not authorized for this path")?;
        return Err(ServerError::Authorization(format!("SYNCH refused for {}", path)));
    }

    let meta = std::fs::metadata(&normalized).map_err(|e| ServerError::Resource(format!("stat {}: {}", path, e)))?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let reply = format!("OK: size={} mtime={} mode={:o}", meta.len(), mtime, file_mode(&meta));
    let out = encode_reply(conn, reply.as_bytes(), secure)?;
    conn.write_frame(Continuation::Done, &out)
}

fn file_mode(meta: &std::fs::Metadata) -> u32 {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        meta.mode()
    }
    #[cfg(not(unix))]
    {
        if meta.permissions().readonly() { 0o444 } else { 0o644 }
    }
}

fn handle_md5(conn: &mut Connection, rest: &str, state: &ServerState, secure: bool) -> Result<()> {
    let payload = decode_payload(conn, rest, secure)?;
    let text = String::from_utf8_lossy(&payload);
    let mut parts = text.split_whitespace();
    let path = parts.next().ok_or_else(|| ServerError::Protocol("MD5 missing path".to_string()))?.to_string();
    let client_digest = parts.next().unwrap_or("").to_string();

    let normalized = acl::normalize_path_subject(&path);
    let identity = caller_identity(conn);
    let decision = acl::evaluate(&state.admit_paths, &state.deny_paths, &path_str(&normalized), &identity, conn.is_encrypted());
    if !decision.grant {
        conn.write_line("BAD: not authorized for this path")?;
        return Err(ServerError::Authorization(format!("MD5 refused for {}", path)));
    }

    let bytes = std::fs::read(&normalized).map_err(|e| ServerError::Resource(format!("read {}: {}", path, e)))?;
    let digest = sha256_hex(&bytes);
    let equal = digest.eq_ignore_ascii_case(&client_digest);
    let reply = if equal { "equal" } else { "not equal" };
    let out = encode_reply(conn, reply.as_bytes(), secure)?;
    conn.write_frame(Continuation::Done, &out)
}

/// Server-computed literal values (fingerprint, class summaries). A small,
/// fixed table stands in for the "external collaborator" spec.md §4.8
/// leaves implementation-defined beyond naming the lookup shape.
fn lookup_variable(conn: &Connection, name: &str) -> Option<String> {
    match name {
        "fingerprint" => conn.key_digest_hex.clone(),
        "peer_ip" => Some(conn.peer_ip.clone()),
        _ => None,
    }
}

fn handle_var(conn: &mut Connection, rest: &str, state: &ServerState, secure: bool) -> Result<()> {
    let payload = decode_payload(conn, rest, secure)?;
    let name = String::from_utf8_lossy(&payload).trim().to_string();

    let identity = caller_identity(conn);
    let decision = acl::evaluate(&state.admit_vars, &state.deny_vars, &name, &identity, conn.is_encrypted());
    if !decision.grant {
        conn.write_line(FAILED)?;
        return Err(ServerError::Authorization(format!("VAR refused for {}", name)));
    }

    match lookup_variable(conn, &name) {
        Some(value) => {
            let out = encode_reply(conn, value.as_bytes(), secure)?;
            conn.write_frame(Continuation::Done, &out)
        }
        None => {
            let out = encode_reply(conn, FAILED.as_bytes(), secure)?;
            conn.write_frame(Continuation::Done, &out)
        }
    }
}

fn handle_context(
    conn: &mut Connection,
    rest: &str,
    state: &ServerState,
    context_store: &ContextStore,
    secure: bool,
) -> Result<()> {
    let payload = decode_payload(conn, rest, secure)?;
    let pattern = String::from_utf8_lossy(&payload).trim().to_string();
    let re = regex::Regex::new(&pattern).map_err(|e| ServerError::Protocol(format!("bad CONTEXT regex: {}", e)))?;

    context_store.purge_expired()?;
    let identity = caller_identity(conn);
    let matches = context_store.scan(|class| re.is_match(class))?;

    let mut packed = Vec::new();
    for (class, _entry) in matches {
        let decision = acl::evaluate(&state.admit_vars, &state.deny_vars, &class, &identity, conn.is_encrypted());
        if decision.grant {
            packed.extend_from_slice(class.as_bytes());
            packed.push(0);
        }
    }
    packed.extend_from_slice(CFD_TERMINATOR.as_bytes());

    let out = encode_reply(conn, &packed, secure)?;
    conn.write_frame(Continuation::Done, &out)
}

fn handle_query(conn: &mut Connection, rest: &str, _state: &ServerState, secure: bool) -> Result<()> {
    let payload = decode_payload(conn, rest, secure)?;
    let name = String::from_utf8_lossy(&payload).trim().to_string();
    // Report queries are delegated to an external collaborator (§4.8); this
    // implementation answers only the liveness probe every deployment needs.
    let reply = match name.as_str() {
        "ping" => "OK: pong".to_string(),
        other => format!("BAD: unknown query '{}'", other),
    };
    let out = encode_reply(conn, reply.as_bytes(), secure)?;
    conn.write_frame(Continuation::Done, &out)
}

fn handle_exec(conn: &mut Connection, rest: &str, state: &ServerState, barrier: &ReloadBarrier) -> Result<()> {
    if !conn.rsa_auth {
        conn.write_line("BAD: EXEC requires an authenticated session")?;
        crate::metrics::record_exec_refusal();
        return Err(ServerError::Authorization("EXEC without rsa_auth".to_string()));
    }
    let username = conn.username.clone().unwrap_or_default();
    if !state.allows_user(&username) {
        conn.write_line("BAD: user not authorized to run commands")?;
        crate::metrics::record_exec_refusal();
        return Err(ServerError::Authorization(format!("EXEC by disallowed user {}", username)));
    }

    let proposed_classes: Vec<String> = rest
        .strip_prefix("--define")
        .map(|s| s.trim_start_matches(' ').split(',').map(|c| c.trim().to_string()).filter(|c| !c.is_empty()).collect())
        .unwrap_or_default();

    let identity = caller_identity(conn);
    if !acl::evaluate_roles(&state.roles, &proposed_classes, &identity) {
        let msg = format!(
            "not authorized to activate these classes/roles on host {}",
            conn.peer_ip
        );
        conn.write_line(&format!("BAD: {}", msg))?;
        crate::metrics::record_exec_refusal();
        return Err(ServerError::Authorization(msg));
    }

    if barrier.active_count() as usize >= state.max_workers.unwrap_or(usize::MAX) {
        conn.write_line("BAD: server too busy")?;
        crate::metrics::record_exec_refusal();
        return Err(ServerError::Resource("EXEC rejected, at capacity".to_string()));
    }

    let output = runner::run_command(&state.cf_run_command, &proposed_classes)?;
    crate::metrics::record_exec_invocation();
    conn.write_frame(Continuation::Done, &output)
}

/// `SCALLBACK collect_calls` (§4.8): queues the request on the call-collect
/// list rather than opening a reverse connection inline (the reverse-
/// connection transport itself is out of scope here). The listener's
/// accept loop drains this queue between iterations.
fn handle_scallback(conn: &mut Connection, rest: &str, callback_queue: &CallbackQueue) -> Result<()> {
    callback_queue.enqueue(conn.peer_ip.clone(), rest.trim().to_string());
    conn.write_line("OK: callback queued")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_verb_and_rest() {
        assert_eq!(split_verb("GET 2048 /etc/passwd"), ("GET", "2048 /etc/passwd"));
        assert_eq!(split_verb("VERSION"), ("VERSION", ""));
    }

    #[test]
    fn identity_required_for_most_verbs() {
        assert!(verb_requires_identity("GET"));
        assert!(!verb_requires_identity("VERSION"));
        assert!(!verb_requires_identity("CAUTH"));
        assert!(!verb_requires_identity("SAUTH"));
        assert!(!verb_requires_identity("STARTTLS"));
    }
}
