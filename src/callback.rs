//! SCALLBACK call-collect queue (§4.8, §9 open question). A request to
//! open a reverse connection is enqueued here rather than acted on inline;
//! the listener's accept loop drains it between iterations, the same
//! "poll, then do the bookkeeping" shape `run_classic`/`run_tls` already
//! use for `purge_live_connections`.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// One queued callback request, identified by the peer that asked for it.
#[derive(Debug, Clone)]
pub struct CallbackJob {
    pub peer_ip: String,
    pub collect_calls: String,
    pub queued_at: u64,
}

/// Jobs past this cap are dropped oldest-first so a stalled drain can't
/// grow the queue without bound.
const MAX_QUEUED: usize = 1024;

pub struct CallbackQueue {
    jobs: Mutex<VecDeque<CallbackJob>>,
}

impl CallbackQueue {
    pub fn new() -> Self {
        Self { jobs: Mutex::new(VecDeque::new()) }
    }

    pub fn enqueue(&self, peer_ip: String, collect_calls: String) {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.len() >= MAX_QUEUED {
            jobs.pop_front();
        }
        jobs.push_back(CallbackJob { peer_ip, collect_calls, queued_at: now_epoch() });
    }

    /// Remove and return every job currently queued, oldest first.
    pub fn drain(&self) -> Vec<CallbackJob> {
        self.jobs.lock().unwrap().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CallbackQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn now_epoch() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_then_drain_is_fifo() {
        let q = CallbackQueue::new();
        q.enqueue("10.0.0.5".to_string(), "a".to_string());
        q.enqueue("10.0.0.6".to_string(), "b".to_string());
        let drained = q.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].peer_ip, "10.0.0.5");
        assert_eq!(drained[1].peer_ip, "10.0.0.6");
        assert!(q.is_empty());
    }

    #[test]
    fn queue_caps_and_drops_oldest() {
        let q = CallbackQueue::new();
        for i in 0..MAX_QUEUED + 10 {
            q.enqueue(format!("10.0.0.{}", i % 255), "x".to_string());
        }
        assert_eq!(q.len(), MAX_QUEUED);
    }
}
