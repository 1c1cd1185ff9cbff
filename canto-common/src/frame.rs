//! Wire format for the framed IPC substrate.
//!
//! Every message on a canto socket is one length-delimited frame with a
//! fixed 16-byte native-endian header followed by a packed payload.
//! Strings inside payloads are NUL-terminated. A frame may carry one file
//! descriptor, passed out of band via `SCM_RIGHTS` and flagged in the
//! header so the receiver knows to claim it.
//!
//! Header layout (native endian):
//!
//! ```text
//! offset  size  field
//!      0     2  len    total frame length, header included
//!      2     2  flags  bit 0: a file descriptor accompanies this frame
//!      4     4  type   MsgType discriminant
//!      8     4  pid    sender process id
//!     12     4  uid    sender user id
//! ```
//!
//! Frames longer than [`MAX_FRAME`] or shorter than the header are
//! protocol errors and terminate the connection.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::os::fd::OwnedFd;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 16;

/// Upper bound on a whole frame, header included.
pub const MAX_FRAME: usize = 16384;

/// Header flag: one file descriptor accompanies this frame.
pub const FLAG_FD: u16 = 0x0001;

/// The closed set of message types carried by canto frames.
///
/// The first group is the client command set, answered and broadcast with
/// the response/event group. The final group travels only on the
/// daemon-to-worker socketpair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MsgType {
    // client commands
    Play = 1,
    TogglePlay = 2,
    Pause = 3,
    Stop = 4,
    Next = 5,
    Prev = 6,
    Jump = 7,
    Mode = 8,
    Flush = 9,
    Show = 10,
    Status = 11,
    Monitor = 12,
    Begin = 13,
    Add = 14,
    Commit = 15,
    Seek = 16,

    // responses and events
    Error = 17,
    PlaylistEntry = 18,
    StatusReply = 19,
    MonitorEvent = 20,

    // player link
    Open = 21,
    Resume = 22,
    Done = 23,
    Position = 24,
    Length = 25,
}

impl MsgType {
    pub fn from_u32(raw: u32) -> Option<MsgType> {
        use MsgType::*;
        Some(match raw {
            1 => Play,
            2 => TogglePlay,
            3 => Pause,
            4 => Stop,
            5 => Next,
            6 => Prev,
            7 => Jump,
            8 => Mode,
            9 => Flush,
            10 => Show,
            11 => Status,
            12 => Monitor,
            13 => Begin,
            14 => Add,
            15 => Commit,
            16 => Seek,
            17 => Error,
            18 => PlaylistEntry,
            19 => StatusReply,
            20 => MonitorEvent,
            21 => Open,
            22 => Resume,
            23 => Done,
            24 => Position,
            25 => Length,
            _ => return None,
        })
    }
}

/// One decoded (or to-be-encoded) frame.
#[derive(Debug)]
pub struct Frame {
    pub msg_type: MsgType,
    pub pid: u32,
    pub uid: u32,
    pub fd: Option<OwnedFd>,
    pub payload: Bytes,
}

impl Frame {
    /// Build a frame stamped with this process's pid and uid.
    pub fn new(msg_type: MsgType, payload: Bytes) -> Frame {
        Frame {
            msg_type,
            pid: std::process::id(),
            uid: unsafe { libc::getuid() },
            fd: None,
            payload,
        }
    }

    /// A frame with an empty payload.
    pub fn empty(msg_type: MsgType) -> Frame {
        Frame::new(msg_type, Bytes::new())
    }

    /// Attach a file descriptor, to be passed alongside the frame bytes.
    pub fn with_fd(mut self, fd: OwnedFd) -> Frame {
        self.fd = Some(fd);
        self
    }

    /// An `Error` frame carrying a NUL-terminated message.
    pub fn error(msg: &str) -> Frame {
        let mut payload = BytesMut::with_capacity(msg.len() + 1);
        put_cstr(&mut payload, msg);
        Frame::new(MsgType::Error, payload.freeze())
    }

    /// Total encoded length of this frame.
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Append the encoded frame to `buf`. The attached fd, if any, is not
    /// consumed here; the transport sends it with the frame bytes.
    pub fn encode(&self, buf: &mut BytesMut) {
        let len = self.wire_len();
        debug_assert!(len <= MAX_FRAME);
        let flags = if self.fd.is_some() { FLAG_FD } else { 0 };
        buf.reserve(len);
        buf.put_u16_ne(len as u16);
        buf.put_u16_ne(flags);
        buf.put_u32_ne(self.msg_type as u32);
        buf.put_u32_ne(self.pid);
        buf.put_u32_ne(self.uid);
        buf.put_slice(&self.payload);
    }
}

/// Pull one complete frame out of `buf` if present.
///
/// Returns `None` while the frame is still partial. The boolean in the
/// result reports whether the sender flagged an accompanying file
/// descriptor; the caller claims it from the transport's fd queue.
pub fn decode_one(buf: &mut BytesMut) -> Result<Option<(Frame, bool)>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let mut header = &buf[..HEADER_LEN];
    let len = header.get_u16_ne() as usize;
    let flags = header.get_u16_ne();
    let raw_type = header.get_u32_ne();
    let pid = header.get_u32_ne();
    let uid = header.get_u32_ne();

    if !(HEADER_LEN..=MAX_FRAME).contains(&len) {
        return Err(Error::Protocol(format!("bad frame length {}", len)));
    }
    let msg_type = MsgType::from_u32(raw_type)
        .ok_or_else(|| Error::Protocol(format!("unknown message type {}", raw_type)))?;

    if buf.len() < len {
        return Ok(None);
    }

    buf.advance(HEADER_LEN);
    let payload = buf.split_to(len - HEADER_LEN).freeze();

    let frame = Frame {
        msg_type,
        pid,
        uid,
        fd: None,
        payload,
    };
    Ok(Some((frame, flags & FLAG_FD != 0)))
}

/// Append `s` as a NUL-terminated string.
pub fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Append a path as NUL-terminated bytes.
pub fn put_path(buf: &mut BytesMut, path: &Path) {
    buf.put_slice(path.as_os_str().as_bytes());
    buf.put_u8(0);
}

/// Take one NUL-terminated string from the front of `payload`.
pub fn take_cstr(payload: &mut Bytes) -> Result<String> {
    let raw = take_cstr_bytes(payload)?;
    String::from_utf8(raw).map_err(|_| Error::Protocol("string is not UTF-8".into()))
}

/// Take one NUL-terminated path from the front of `payload`.
pub fn take_path(payload: &mut Bytes) -> Result<PathBuf> {
    let raw = take_cstr_bytes(payload)?;
    Ok(PathBuf::from(std::ffi::OsString::from_vec(raw)))
}

fn take_cstr_bytes(payload: &mut Bytes) -> Result<Vec<u8>> {
    let nul = payload
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::Protocol("unterminated string in payload".into()))?;
    let raw = payload.split_to(nul).to_vec();
    payload.advance(1);
    Ok(raw)
}
