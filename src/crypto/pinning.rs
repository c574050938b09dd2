//! Trust-on-first-use store for peer public-key digests, keyed by
//! `username@ip`. Binary file format and atomic-write discipline mirror the
//! keyring store this crate inherited from its teacher.
//!
//! File `<root>/trustdb.bin` (LE):
//! - Header (16 B): `[magic8="CMTRUST1"][version u32=1][reserved u32=0]`
//! - Body: records `[key_len u16][key bytes][digest 32]`
//!
//! A lookup that finds no record is "unknown peer" (caller decides whether
//! to admit on trust, per §4.5/§4.6). A lookup that finds a record whose
//! digest differs from the presented one is a pinning violation and must
//! refuse the connection regardless of any `trustkey` flag.

use byteorder::{ByteOrder, LittleEndian};
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::crypto::longterm::KeyDigest;
use crate::error::{Result, ServerError};

const MAGIC: &[u8; 8] = b"CMTRUST1";
const VERSION: u32 = 1;
const HDR_SIZE: u64 = 16;

fn io_err(context: &str, e: std::io::Error) -> ServerError {
    ServerError::Resource(format!("{}: {}", context, e))
}

pub struct PinningStore {
    root: PathBuf,
    path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOutcome {
    /// No prior record; caller may admit on trust and pin now.
    Unknown,
    /// Matches the pinned digest.
    Matches,
    /// A different key was pinned for this identity previously.
    Mismatch,
}

impl PinningStore {
    pub fn open_or_create(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root).map_err(|e| io_err("create state dir", e))?;
        let path = root.join("trustdb.bin");
        if !path.exists() {
            let _lk = Self::lock(root)?;
            if !path.exists() {
                let mut f = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&path)
                    .map_err(|e| io_err("create trustdb", e))?;
                write_header(&mut f)?;
                let _ = f.sync_all();
            }
        }
        Ok(Self { root: root.to_path_buf(), path })
    }

    /// Check `digest` against any record stored for `key`. Does not write.
    pub fn check(&self, key: &str, digest: &KeyDigest) -> Result<PinOutcome> {
        let records = self.read_all()?;
        match records.get(key) {
            None => Ok(PinOutcome::Unknown),
            Some(stored) if stored.0 == digest.0 => Ok(PinOutcome::Matches),
            Some(_) => Ok(PinOutcome::Mismatch),
        }
    }

    /// Pin `digest` under `key`, overwriting any prior record. Callers must
    /// only do this after a successful trust-on-first-use admission.
    pub fn pin(&self, key: &str, digest: &KeyDigest) -> Result<()> {
        if key.len() > u16::MAX as usize {
            return Err(ServerError::Internal("pinning key too long".to_string()));
        }
        let _lk = Self::lock(&self.root)?;

        let mut records = self.read_all()?;
        records.insert(key.to_string(), digest.clone());

        let tmp = self.path.with_extension("bin.tmp");
        let mut tf = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .map_err(|e| io_err("open trustdb tmp", e))?;
        write_header(&mut tf)?;

        let mut entries: Vec<(&String, &KeyDigest)> = records.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        for (k, d) in entries {
            let kbytes = k.as_bytes();
            let mut len_buf = [0u8; 2];
            LittleEndian::write_u16(&mut len_buf, kbytes.len() as u16);
            tf.write_all(&len_buf).map_err(|e| io_err("write trustdb", e))?;
            tf.write_all(kbytes).map_err(|e| io_err("write trustdb", e))?;
            tf.write_all(&d.0).map_err(|e| io_err("write trustdb", e))?;
        }
        let _ = tf.sync_all();

        std::fs::rename(&tmp, &self.path).map_err(|e| io_err("rename trustdb", e))?;
        fsync_parent_dir(&self.path);
        Ok(())
    }

    fn lock(root: &Path) -> Result<File> {
        let lp = root.join("trustdb.bin.lock");
        let f = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lp)
            .map_err(|e| io_err("open trustdb lock", e))?;
        f.lock_exclusive().map_err(|e| io_err("lock trustdb", e))?;
        Ok(f)
    }

    fn read_all(&self) -> Result<HashMap<String, KeyDigest>> {
        let mut out = HashMap::new();
        if !self.path.exists() {
            return Ok(out);
        }
        let mut f = OpenOptions::new()
            .read(true)
            .open(&self.path)
            .map_err(|e| io_err("open trustdb", e))?;
        let len = f.metadata().map_err(|e| io_err("stat trustdb", e))?.len();
        if len < HDR_SIZE {
            return Err(ServerError::Resource("trustdb smaller than header".to_string()));
        }
        let mut hdr = [0u8; HDR_SIZE as usize];
        f.read_exact(&mut hdr).map_err(|e| io_err("read trustdb header", e))?;
        if &hdr[0..8] != MAGIC {
            return Err(ServerError::Resource("bad trustdb magic".to_string()));
        }
        if LittleEndian::read_u32(&hdr[8..12]) != VERSION {
            return Err(ServerError::Resource("unsupported trustdb version".to_string()));
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
            let mut dbuf = [0u8; 32];
            if f.read_exact(&mut dbuf).is_err() {
                break;
            }
            if let Ok(key) = String::from_utf8(kbuf) {
                out.insert(key, KeyDigest(dbuf));
            }
        }
        Ok(out)
    }
}

fn write_header(f: &mut File) -> Result<()> {
    f.write_all(MAGIC).map_err(|e| io_err("write trustdb header", e))?;
    let mut buf = [0u8; 4];
    LittleEndian::write_u32(&mut buf, VERSION);
    f.write_all(&buf).map_err(|e| io_err("write trustdb header", e))?;
    LittleEndian::write_u32(&mut buf, 0);
    f.write_all(&buf).map_err(|e| io_err("write trustdb header", e))
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
