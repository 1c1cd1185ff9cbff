//! The worker's side of the privileged socketpair.
//!
//! Wraps the blocking frame stream into directives for the decode
//! session and event senders for the daemon. The link owns the handoff
//! of the next track: an `Open` arriving mid-session is stashed here and
//! the session is told to stop.

use canto_common::error::{Error, Result};
use canto_common::frame::{self, Frame, MsgType};
use canto_common::proto::SeekRequest;
use canto_common::stream::FrameStream;
use bytes::{BufMut, BytesMut};
use std::fs::File;
use std::path::PathBuf;
use tracing::debug;

/// A track handed over by the daemon: the open descriptor and the path
/// it came from (for logging only; the worker never opens paths).
pub struct Track {
    pub file: File,
    pub path: PathBuf,
}

/// One command, as seen by the decode session.
pub enum Directive {
    Stop,
    Pause,
    Resume,
    Seek(SeekRequest),
    /// A new track arrived and is stashed; the current session ends.
    NewTrack,
}

pub struct PlayerLink {
    stream: FrameStream,
    pending: Option<Track>,
}

impl PlayerLink {
    pub fn new(stream: FrameStream) -> PlayerLink {
        PlayerLink {
            stream,
            pending: None,
        }
    }

    /// Block until a track is available. Directives arriving while
    /// nothing plays are acknowledged and dropped.
    pub fn wait_for_track(&mut self) -> Result<Track> {
        loop {
            if let Some(track) = self.pending.take() {
                return Ok(track);
            }
            self.next(true)?;
        }
    }

    /// Process one message from the daemon. With `wait` false, returns
    /// `Ok(None)` when nothing is queued.
    pub fn next(&mut self, wait: bool) -> Result<Option<Directive>> {
        let Some(frame) = self.stream.recv(wait)? else {
            return Ok(None);
        };
        match frame.msg_type {
            MsgType::Open => {
                if self.pending.is_some() {
                    return Err(Error::Protocol("track already queued".into()));
                }
                let fd = frame
                    .fd
                    .ok_or_else(|| Error::Protocol("open without an fd".into()))?;
                let mut payload = frame.payload;
                let path = frame::take_path(&mut payload)?;
                debug!(path = %path.display(), "track queued");
                self.pending = Some(Track {
                    file: File::from(fd),
                    path,
                });
                Ok(Some(Directive::NewTrack))
            }
            MsgType::Resume => Ok(Some(Directive::Resume)),
            MsgType::Pause => Ok(Some(Directive::Pause)),
            MsgType::Stop => Ok(Some(Directive::Stop)),
            MsgType::Seek => Ok(Some(Directive::Seek(SeekRequest::decode(&frame.payload)?))),
            other => Err(Error::Protocol(format!(
                "unexpected message {:?} on player link",
                other
            ))),
        }
    }

    pub fn send_done(&mut self) -> Result<()> {
        self.stream.send(Frame::empty(MsgType::Done))
    }

    pub fn send_error(&mut self, msg: &str) -> Result<()> {
        self.stream.send(Frame::error(msg))
    }

    pub fn send_position(&mut self, secs: i64) -> Result<()> {
        self.stream.send(Frame::new(MsgType::Position, seconds(secs)))
    }

    pub fn send_length(&mut self, secs: i64) -> Result<()> {
        self.stream.send(Frame::new(MsgType::Length, seconds(secs)))
    }
}

fn seconds(secs: i64) -> bytes::Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_i64_ne(secs);
    buf.freeze()
}
