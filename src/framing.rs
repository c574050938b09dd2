//! Wire framing: length-delimited transactions over a plain socket or a TLS
//! stream.
//!
//! Frame layout (LE): `[length: u32][flag: u8]` followed by exactly
//! `length` payload bytes. `flag` is `FLAG_MORE` for a continuation frame,
//! `FLAG_DONE` for the final frame of a transaction. Identical over plain
//! TCP and TLS; only the underlying `Read`/`Write` changes.

use byteorder::{ByteOrder, LittleEndian};
use std::io::{Read, Write};
use std::time::Duration;

use crate::consts::{FLAG_DONE, FLAG_MORE, FRAME_HDR_SIZE, MAX_PAYLOAD};
use crate::error::{Result, ServerError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    More,
    Done,
}

impl Continuation {
    fn to_byte(self) -> u8 {
        match self {
            Continuation::More => FLAG_MORE,
            Continuation::Done => FLAG_DONE,
        }
    }

    fn from_byte(b: u8) -> Result<Self> {
        match b {
            FLAG_MORE => Ok(Continuation::More),
            FLAG_DONE => Ok(Continuation::Done),
            other => Err(ServerError::Transport(format!(
                "malformed frame header: unknown flag byte {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub flag: Continuation,
    pub payload: Vec<u8>,
}

/// Read exactly one frame, honoring `MAX_PAYLOAD`. Returns
/// `Err(Transport)` on short read, malformed header, or an advertised
/// length exceeding the buffer.
pub fn read_frame<R: Read>(r: &mut R) -> Result<Frame> {
    let mut hdr = [0u8; FRAME_HDR_SIZE];
    read_exact(r, &mut hdr)?;

    let len = LittleEndian::read_u32(&hdr[0..4]);
    let flag = Continuation::from_byte(hdr[4])?;

    if len > MAX_PAYLOAD {
        return Err(ServerError::Transport(format!(
            "frame length {} exceeds MAX_PAYLOAD {}",
            len, MAX_PAYLOAD
        )));
    }

    let mut payload = vec![0u8; len as usize];
    if len > 0 {
        read_exact(r, &mut payload)?;
    }

    Ok(Frame { flag, payload })
}

/// Write header-then-payload as a single logical operation.
pub fn write_frame<W: Write>(w: &mut W, flag: Continuation, payload: &[u8]) -> Result<()> {
    if payload.len() as u64 > MAX_PAYLOAD as u64 {
        return Err(ServerError::Internal(format!(
            "attempted to write oversized frame ({} bytes)",
            payload.len()
        )));
    }
    let mut hdr = [0u8; FRAME_HDR_SIZE];
    LittleEndian::write_u32(&mut hdr[0..4], payload.len() as u32);
    hdr[4] = flag.to_byte();

    w.write_all(&hdr)
        .map_err(|e| ServerError::Transport(format!("frame header write: {}", e)))?;
    if !payload.is_empty() {
        w.write_all(payload)
            .map_err(|e| ServerError::Transport(format!("frame payload write: {}", e)))?;
    }
    Ok(())
}

/// Convenience: write a single-frame (`Done`) transaction carrying a text
/// line.
pub fn write_line<W: Write>(w: &mut W, line: &str) -> Result<()> {
    write_frame(w, Continuation::Done, line.as_bytes())
}

fn read_exact<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<()> {
    use std::io::ErrorKind;
    let mut off = 0usize;
    while off < buf.len() {
        match r.read(&mut buf[off..]) {
            Ok(0) => {
                return Err(ServerError::Transport(
                    "short read: peer closed connection mid-frame".to_string(),
                ))
            }
            Ok(n) => off += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {
                return Err(ServerError::Transport(format!("receive timeout: {}", e)))
            }
            Err(e) => return Err(ServerError::Transport(format!("read error: {}", e))),
        }
    }
    Ok(())
}

/// Apply a per-receive timeout to a `TcpStream`. A no-op for TLS streams
/// that wrap a `TcpStream` internally set up with its own timeout at
/// accept time.
pub fn apply_recv_timeout(stream: &std::net::TcpStream, secs: u64) -> std::io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(secs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trip_single_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, Continuation::Done, b"hello").unwrap();
        let mut cur = Cursor::new(buf);
        let frame = read_frame(&mut cur).unwrap();
        assert_eq!(frame.flag, Continuation::Done);
        assert_eq!(frame.payload, b"hello");
    }

    #[test]
    fn rejects_oversized_length() {
        let mut hdr = [0u8; FRAME_HDR_SIZE];
        LittleEndian::write_u32(&mut hdr[0..4], MAX_PAYLOAD + 1);
        hdr[4] = FLAG_DONE;
        let mut cur = Cursor::new(hdr.to_vec());
        let err = read_frame(&mut cur).unwrap_err();
        assert!(matches!(err, ServerError::Transport(_)));
    }

    #[test]
    fn rejects_short_read() {
        let mut cur = Cursor::new(vec![5, 0, 0, 0]); // header truncated
        let err = read_frame(&mut cur).unwrap_err();
        assert!(matches!(err, ServerError::Transport(_)));
    }

    #[test]
    fn rejects_unknown_flag_byte() {
        let mut hdr = [0u8; FRAME_HDR_SIZE];
        LittleEndian::write_u32(&mut hdr[0..4], 0);
        hdr[4] = 7;
        let mut cur = Cursor::new(hdr.to_vec());
        let err = read_frame(&mut cur).unwrap_err();
        assert!(matches!(err, ServerError::Transport(_)));
    }

    #[test]
    fn multi_frame_continuation_then_done() {
        let mut buf = Vec::new();
        write_frame(&mut buf, Continuation::More, b"part1").unwrap();
        write_frame(&mut buf, Continuation::Done, b"part2").unwrap();
        let mut cur = Cursor::new(buf);
        let f1 = read_frame(&mut cur).unwrap();
        let f2 = read_frame(&mut cur).unwrap();
        assert_eq!(f1.flag, Continuation::More);
        assert_eq!(f2.flag, Continuation::Done);
        assert_eq!([f1.payload, f2.payload].concat(), b"part1part2");
    }
}
