//! Context store (§4.8, §4.11): class name → `{value, expires}`, the
//! record kind `CONTEXT`/`SCONTEXT` persist and scan. Same binary-record
//! technique as `crypto::pinning` and, before it, the teacher's
//! `crypto/keyring.rs`: fixed header, length-prefixed records, `fs2`
//! exclusive lock around mutation, tmp+rename for atomic rewrite.

use byteorder::{ByteOrder, LittleEndian};
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Result, ServerError};

const MAGIC: &[u8; 8] = b"CMCTXDB1";
const VERSION: u32 = 1;
const HDR_SIZE: u64 = 16;

fn io_err(context: &str, e: std::io::Error) -> ServerError {
    ServerError::Resource(format!("{}: {}", context, e))
}

#[derive(Debug, Clone)]
pub struct ContextEntry {
    pub value: String,
    /// Epoch seconds after which this entry is no longer returned by scans.
    pub expires_at: u64,
}

pub struct ContextStore {
    root: PathBuf,
    path: PathBuf,
}

impl ContextStore {
    pub fn open_or_create(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| io_err("create state dir", e))?;
        let path = root.join("contextdb.bin");
        if !path.exists() {
            let _lk = Self::lock(root)?;
            if !path.exists() {
                let mut f = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&path)
                    .map_err(|e| io_err("create contextdb", e))?;
                write_header(&mut f)?;
                let _ = f.sync_all();
            }
        }
        Ok(Self { root: root.to_path_buf(), path })
    }

    pub fn set(&self, class: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let _lk = Self::lock(&self.root)?;
        let mut entries = self.read_all()?;
        let expires_at = now_epoch() + ttl_secs;
        entries.insert(class.to_string(), ContextEntry { value: value.to_string(), expires_at });
        self.write_all(&entries)
    }

    /// Return every non-expired entry whose class name satisfies `matches`.
    pub fn scan<F: Fn(&str) -> bool>(&self, matches: F) -> Result<Vec<(String, ContextEntry)>> {
        let now = now_epoch();
        let entries = self.read_all()?;
        Ok(entries
            .into_iter()
            .filter(|(k, e)| e.expires_at > now && matches(k))
            .collect())
    }

    /// Drop expired entries from the backing file. Cheap to call on every
    /// scan; made a separate entry point so callers can batch it.
    pub fn purge_expired(&self) -> Result<usize> {
        let _lk = Self::lock(&self.root)?;
        let now = now_epoch();
        let entries = self.read_all()?;
        let before = entries.len();
        let kept: HashMap<String, ContextEntry> =
            entries.into_iter().filter(|(_, e)| e.expires_at > now).collect();
        let dropped = before - kept.len();
        if dropped > 0 {
            self.write_all(&kept)?;
        }
        Ok(dropped)
    }

    fn lock(root: &Path) -> Result<File> {
        let lp = root.join("contextdb.bin.lock");
        let f = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lp)
            .map_err(|e| io_err("open contextdb lock", e))?;
        f.lock_exclusive().map_err(|e| io_err("lock contextdb", e))?;
        Ok(f)
    }

    fn read_all(&self) -> Result<HashMap<String, ContextEntry>> {
        let mut out = HashMap::new();
        if !self.path.exists() {
            return Ok(out);
        }
        let mut f = OpenOptions::new()
            .read(true)
            .open(&self.path)
            .map_err(|e| io_err("open contextdb", e))?;
        let len = f.metadata().map_err(|e| io_err("stat contextdb", e))?.len();
        if len < HDR_SIZE {
            return Err(ServerError::Resource("contextdb smaller than header".to_string()));
        }
        let mut hdr = [0u8; HDR_SIZE as usize];
        f.read_exact(&mut hdr).map_err(|e| io_err("read contextdb header", e))?;
        if &hdr[0..8] != MAGIC {
            return Err(ServerError::Resource("bad contextdb magic".to_string()));
        }
        if LittleEndian::read_u32(&hdr[8..12]) != VERSION {
            return Err(ServerError::Resource("unsupported contextdb version".to_string()));
        }

        loop {
            let mut len_buf = [0u8; 2];
            if f.read_exact(&mut len_buf).is_err() {
                break;
            }
            let klen = LittleEndian::read_u16(&len_buf) as usize;
            let mut kbuf = vec![0u8; klen];
            if f.read_exact(&mut kbuf).is_err() {
                break;
            }

            let mut vlen_buf = [0u8; 4];
            if f.read_exact(&mut vlen_buf).is_err() {
                break;
            }
            let vlen = LittleEndian::read_u32(&vlen_buf) as usize;
            let mut vbuf = vec![0u8; vlen];
            if f.read_exact(&mut vbuf).is_err() {
                break;
            }

            let mut exp_buf = [0u8; 8];
            if f.read_exact(&mut exp_buf).is_err() {
                break;
            }
            let expires_at = LittleEndian::read_u64(&exp_buf);

            if let (Ok(key), Ok(value)) = (String::from_utf8(kbuf), String::from_utf8(vbuf)) {
                out.insert(key, ContextEntry { value, expires_at });
            }
        }
        Ok(out)
    }

    fn write_all(&self, entries: &HashMap<String, ContextEntry>) -> Result<()> {
        let tmp = self.path.with_extension("bin.tmp");
        let mut tf = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .map_err(|e| io_err("open contextdb tmp", e))?;
        write_header(&mut tf)?;

        let mut items: Vec<(&String, &ContextEntry)> = entries.iter().collect();
        items.sort_by(|a, b| a.0.cmp(b.0));
        for (k, e) in items {
            let kbytes = k.as_bytes();
            let vbytes = e.value.as_bytes();
            let mut u16_buf = [0u8; 2];
            LittleEndian::write_u16(&mut u16_buf, kbytes.len() as u16);
            tf.write_all(&u16_buf).map_err(|err| io_err("write contextdb", err))?;
            tf.write_all(kbytes).map_err(|err| io_err("write contextdb", err))?;

            let mut u32_buf = [0u8; 4];
            LittleEndian::write_u32(&mut u32_buf, vbytes.len() as u32);
            tf.write_all(&u32_buf).map_err(|err| io_err("write contextdb", err))?;
            tf.write_all(vbytes).map_err(|err| io_err("write contextdb", err))?;

            let mut u64_buf = [0u8; 8];
            LittleEndian::write_u64(&mut u64_buf, e.expires_at);
            tf.write_all(&u64_buf).map_err(|err| io_err("write contextdb", err))?;
        }
        let _ = tf.sync_all();

        std::fs::rename(&tmp, &self.path).map_err(|e| io_err("rename contextdb", e))?;
        fsync_parent_dir(&self.path);
        Ok(())
    }
}

fn write_header(f: &mut File) -> Result<()> {
    f.write_all(MAGIC).map_err(|e| io_err("write contextdb header", e))?;
    let mut buf = [0u8; 4];
    LittleEndian::write_u32(&mut buf, VERSION);
    f.write_all(&buf).map_err(|e| io_err("write contextdb header", e))?;
    LittleEndian::write_u32(&mut buf, 0);
    f.write_all(&buf).map_err(|e| io_err("write contextdb header", e))
}

fn now_epoch() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(unix)]
fn fsync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}
#[cfg(not(unix))]
fn fsync_parent_dir(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_root(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("cmserverd-ctx-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn set_then_scan_finds_entry() {
        let root = tmp_root("scan");
        let store = ContextStore::open_or_create(&root).unwrap();
        store.set("linux_x86_64", "true", 3600).unwrap();
        let found = store.scan(|k| k.starts_with("linux_")).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, "linux_x86_64");
    }

    #[test]
    fn expired_entries_excluded_from_scan() {
        let root = tmp_root("expire");
        let store = ContextStore::open_or_create(&root).unwrap();
        store.set("stale", "x", 0).unwrap();
        let found = store.scan(|_| true).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn purge_removes_expired_records() {
        let root = tmp_root("purge");
        let store = ContextStore::open_or_create(&root).unwrap();
        store.set("stale", "x", 0).unwrap();
        store.set("fresh", "y", 3600).unwrap();
        let dropped = store.purge_expired().unwrap();
        assert_eq!(dropped, 1);
        let remaining = store.scan(|_| true).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].0, "fresh");
    }
}
