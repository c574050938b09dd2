//! Wire protocol constants.
//!
//! Frame header layout (LE): [length: u32][flag: u8]. `flag` is `FLAG_MORE`
//! for a continuation frame and `FLAG_DONE` for the final frame of a
//! transaction.

pub const FRAME_HDR_SIZE: usize = 5;
pub const FLAG_MORE: u8 = 0;
pub const FLAG_DONE: u8 = 1;

/// Smallest allowed frame payload. Below this a GET/SGET block-size request
/// is nonsensical.
pub const MIN_PAYLOAD: u32 = 1;
/// Largest allowed frame payload (64 KiB, per spec's "≥4 KiB, ≤64 KiB").
pub const MAX_PAYLOAD: u32 = 64 * 1024;

/// Default GET/SGET block size when the caller does not request one.
pub const DEFAULT_BLOCK_SIZE: u32 = 2048;

/// Re-stat cadence while streaming a file: every N blocks the server
/// re-stats the source file to detect a size change mid-transfer.
pub const RESTAT_EVERY_SMALL: u64 = 3;
pub const RESTAT_EVERY_LARGE: u64 = 32;
pub const LARGE_FILE_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Sentinel marking the end of a multi-frame reply (directory listing,
/// class-match set).
pub const CFD_TERMINATOR: &str = "\x00\x00\x00";

/// Fixed refusal string.
pub const FAILED: &str = "FAILED";

/// Purge horizon for stale `live_connections` entries.
pub const LIVE_CONN_PURGE_SECS: u64 = 2 * 60 * 60;

/// Per-receive timeout applied to every framed read.
pub const DEFAULT_RECV_TIMEOUT_SECS: u64 = 30;

/// Worker thread stack size.
pub const WORKER_STACK_SIZE: usize = 1024 * 1024;

/// Listener select-style wait timeout.
pub const ACCEPT_POLL_SECS: u64 = 60;

/// How often the reload watcher re-reads the policy-validated timestamp
/// file (§6).
pub const RELOAD_POLL_SECS: u64 = 5;

/// How long the reload watcher waits for active workers to quiesce before
/// giving up on one reload attempt and trying again next poll.
pub const RELOAD_BARRIER_TIMEOUT_SECS: u64 = 30;

/// Consecutive worker-cap rejections before apoptosis.
pub const APOPTOSIS_THRESHOLD: u64 = 100;

/// Cipher tag namespace. `'c'` is the only member: AES-256-GCM. Unknown
/// tags are a protocol error.
pub const CIPHER_TAG_AES256GCM: u8 = b'c';

pub const DEFAULT_PORT: u16 = 5308;

pub fn version_string() -> String {
    format!("cmserverd {}", env!("CARGO_PKG_VERSION"))
}
