//! Process-wide server state (spec.md §3). Created at start, rebuilt on
//! reload, destroyed at shutdown; immutable for the lifetime of any worker
//! — the reload barrier (`reload.rs`) is the only path that replaces it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::acl::AclRule;
use crate::policy::{HostsSpec, RunSpec};

pub struct ServerState {
    pub admit_paths: Vec<AclRule>,
    pub deny_paths: Vec<AclRule>,
    pub admit_vars: Vec<AclRule>,
    pub deny_vars: Vec<AclRule>,
    pub roles: Vec<AclRule>,

    pub attackers: Vec<String>,
    pub non_attackers: Vec<String>,
    pub multi_conn: Vec<String>,
    pub allow_users: Vec<String>,
    pub trust_keys: Vec<String>,
    pub skip_verify: Vec<String>,
    pub allow_legacy: Vec<String>,

    pub cf_run_command: String,
    pub max_workers: Option<usize>,
    pub cipher_preference: Option<String>,

    /// IP -> last-seen epoch second. Guarded by its own mutex (the
    /// "counter_mutex" of spec.md §5), never persisted.
    pub live_connections: Mutex<HashMap<String, u64>>,
}

impl ServerState {
    pub fn new(
        admit_paths: Vec<AclRule>,
        deny_paths: Vec<AclRule>,
        admit_vars: Vec<AclRule>,
        deny_vars: Vec<AclRule>,
        roles: Vec<AclRule>,
        hosts: HostsSpec,
        run: RunSpec,
    ) -> Self {
        Self {
            admit_paths,
            deny_paths,
            admit_vars,
            deny_vars,
            roles,
            attackers: hosts.attackers,
            non_attackers: hosts.non_attackers,
            multi_conn: hosts.multi_conn,
            allow_users: hosts.allow_users,
            trust_keys: hosts.trust_keys,
            skip_verify: hosts.skip_verify,
            allow_legacy: hosts.allow_legacy,
            cf_run_command: run.cf_run_command,
            max_workers: run.max_workers,
            cipher_preference: run.cipher_preference,
            live_connections: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_attacker(&self, ip: &str) -> bool {
        self.attackers.iter().any(|a| a == ip)
    }

    /// Whitelist semantics: if `non_attackers` is non-empty, only listed
    /// IPs are admitted.
    pub fn is_allowed_by_whitelist(&self, ip: &str) -> bool {
        self.non_attackers.is_empty() || self.non_attackers.iter().any(|a| a == ip)
    }

    pub fn allows_multi_conn(&self, ip: &str) -> bool {
        self.multi_conn.iter().any(|a| a == ip)
    }

    pub fn auto_trusts(&self, ip: &str) -> bool {
        self.trust_keys.iter().any(|a| a == ip)
    }

    pub fn skips_verify(&self, ip: &str) -> bool {
        self.skip_verify.iter().any(|a| a == ip)
    }

    pub fn allows_user(&self, username: &str) -> bool {
        self.allow_users.iter().any(|a| a == username)
    }
}

/// The swappable handle workers and listeners actually hold (§4.9, §9
/// REDESIGN FLAGS): `ServerState` itself stays an immutable value; this is
/// the single mutable cell a reload replaces under the barrier's
/// "no live workers" precondition. A worker loads one snapshot at spawn and
/// keeps using it for the life of the connection, never re-reading the
/// handle mid-request.
pub struct StateHandle {
    current: Mutex<Arc<ServerState>>,
}

impl StateHandle {
    pub fn new(state: ServerState) -> Self {
        Self { current: Mutex::new(Arc::new(state)) }
    }

    /// Snapshot the currently installed `ServerState`.
    pub fn load(&self) -> Arc<ServerState> {
        self.current.lock().unwrap().clone()
    }

    /// Install a newly built `ServerState`. Callers are responsible for
    /// only calling this under `ReloadBarrier::reload`/`reload_timeout`.
    pub fn store(&self, state: ServerState) {
        *self.current.lock().unwrap() = Arc::new(state);
    }
}

#[cfg(test)]
mod state_handle_tests {
    use super::*;
    use crate::policy::PolicyFile;

    #[test]
    fn store_replaces_what_load_returns() {
        let handle = StateHandle::new(PolicyFile::default().into_server_state().unwrap());
        let before = handle.load();
        assert!(before.allow_users.is_empty());

        let mut file = PolicyFile::default();
        file.hosts.allow_users.push("alice".to_string());
        handle.store(file.into_server_state().unwrap());

        let after = handle.load();
        assert_eq!(after.allow_users, vec!["alice".to_string()]);
        assert!(before.allow_users.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyFile;

    #[test]
    fn whitelist_empty_admits_everyone() {
        let state = PolicyFile::default().into_server_state().unwrap();
        assert!(state.is_allowed_by_whitelist("1.2.3.4"));
    }

    #[test]
    fn whitelist_non_empty_restricts() {
        let mut file = PolicyFile::default();
        file.hosts.non_attackers.push("10.0.0.1".to_string());
        let state = file.into_server_state().unwrap();
        assert!(state.is_allowed_by_whitelist("10.0.0.1"));
        assert!(!state.is_allowed_by_whitelist("10.0.0.2"));
    }
}
