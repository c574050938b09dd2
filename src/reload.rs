//! Reload barrier (§4.9, §5): gates rebuilding `ServerState` on
//! `active_workers == 0`. Same `Mutex`+`Condvar` coordination shape the
//! teacher uses in `wal/registry.rs`'s `WalInner` flush state, adapted from
//! "wait for the in-flight fsync to finish" to "wait for every worker to
//! exit".

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{info, warn};

use crate::policy::PolicyFile;
use crate::state::StateHandle;

pub struct ReloadBarrier {
    active_workers: Mutex<u64>,
    idle: Condvar,
}

impl ReloadBarrier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            active_workers: Mutex::new(0),
            idle: Condvar::new(),
        })
    }

    /// Register one worker starting. Returns a guard that decrements the
    /// counter and wakes any waiting reload on drop, so a panicking worker
    /// still releases the barrier.
    pub fn enter(self: &Arc<Self>) -> WorkerGuard {
        let mut count = self.active_workers.lock().unwrap();
        *count += 1;
        WorkerGuard { barrier: self.clone() }
    }

    pub fn active_count(&self) -> u64 {
        *self.active_workers.lock().unwrap()
    }

    /// Block until `active_workers` reaches zero, then run `rebuild`.
    /// New workers spawned after this call begins still observe the old
    /// state until `rebuild` returns (callers swap the shared `ServerState`
    /// only once this returns).
    pub fn reload<F: FnOnce()>(&self, rebuild: F) {
        let guard = self.active_workers.lock().unwrap();
        let _guard = self
            .idle
            .wait_while(guard, |count| *count > 0)
            .unwrap();
        rebuild();
    }

    /// Same as `reload` but gives up after `timeout` rather than blocking
    /// forever on a stuck worker; returns whether the rebuild ran.
    pub fn reload_timeout<F: FnOnce()>(&self, timeout: Duration, rebuild: F) -> bool {
        let guard = self.active_workers.lock().unwrap();
        let (guard, result) = self
            .idle
            .wait_timeout_while(guard, timeout, |count| *count > 0)
            .unwrap();
        drop(guard);
        if result.timed_out() {
            return false;
        }
        rebuild();
        true
    }
}

/// Read the policy-validated timestamp file (§6): a single epoch-second
/// integer an external collaborator rewrites whenever it has validated a
/// new policy on disk. Missing or malformed is treated as "no reload
/// pending" rather than an error — the file is optional bookkeeping, not a
/// precondition for the daemon to run.
fn read_trigger_stamp(path: &Path) -> Option<u64> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Poll `trigger_path` every `poll_interval`; whenever its stamp changes,
/// reload `policy_path` into a fresh `ServerState` and swap it into `state`
/// once `barrier` observes `active_workers == 0` (deferring, per scenario 5,
/// while a worker is still live). Runs until `terminate` is set.
pub fn run_reload_watcher(
    policy_path: PathBuf,
    trigger_path: PathBuf,
    state: Arc<StateHandle>,
    barrier: Arc<ReloadBarrier>,
    poll_interval: Duration,
    barrier_timeout: Duration,
    terminate: Arc<AtomicBool>,
) {
    let mut last_seen = read_trigger_stamp(&trigger_path);
    while !terminate.load(Ordering::Relaxed) {
        std::thread::sleep(poll_interval);
        let current = read_trigger_stamp(&trigger_path);
        if current.is_none() || current == last_seen {
            continue;
        }

        let policy = match PolicyFile::load(&policy_path) {
            Ok(p) => p,
            Err(e) => {
                warn!("reload: failed to load policy {}: {}", policy_path.display(), e);
                // Not retried until the stamp changes again: a policy file
                // that fails to parse won't start parsing on its own.
                last_seen = current;
                continue;
            }
        };
        let new_state = match policy.into_server_state() {
            Ok(s) => s,
            Err(e) => {
                warn!("reload: policy {} rejected: {}", policy_path.display(), e);
                last_seen = current;
                continue;
            }
        };

        // Deferred while a worker is active (scenario 5); `last_seen` is
        // only advanced once the swap actually lands, so a stuck worker
        // gets retried on every subsequent poll instead of being skipped.
        let applied = barrier.reload_timeout(barrier_timeout, || state.store(new_state));
        if applied {
            last_seen = current;
            info!("reload: applied new policy from {}", policy_path.display());
            crate::metrics::record_reload_applied();
        } else {
            warn!("reload: active workers still live, deferring reload to next poll");
        }
    }
}

pub struct WorkerGuard {
    barrier: Arc<ReloadBarrier>,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let mut count = self.barrier.active_workers.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            self.barrier.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn reload_runs_immediately_when_idle() {
        let barrier = ReloadBarrier::new();
        let mut ran = false;
        barrier.reload(|| ran = true);
        assert!(ran);
    }

    #[test]
    fn reload_waits_for_active_worker_to_exit() {
        let barrier = ReloadBarrier::new();
        let guard = barrier.enter();
        assert_eq!(barrier.active_count(), 1);

        let barrier_clone = barrier.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            drop(guard);
        });

        let mut ran = false;
        barrier_clone.reload(|| ran = true);
        assert!(ran);
        assert_eq!(barrier_clone.active_count(), 0);
        handle.join().unwrap();
    }

    #[test]
    fn reload_timeout_gives_up_on_stuck_worker() {
        let barrier = ReloadBarrier::new();
        let _guard = barrier.enter();
        let ran = barrier.reload_timeout(Duration::from_millis(20), || {});
        assert!(!ran);
    }
}
