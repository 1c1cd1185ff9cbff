//! Typed payloads carried inside frames.
//!
//! All payloads are packed native-endian fields, matching the framing
//! rules in [`crate::frame`]. Decoders check the exact payload size so a
//! wrong-size message can be answered (or dropped) deliberately.

use crate::error::{Error, Result};
use crate::frame::{self, MsgType};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::path::PathBuf;

/// Tri-state request for one playback-mode flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModeChange {
    /// Keep the current value.
    #[default]
    Leave,
    Unset,
    Set,
    Toggle,
}

impl ModeChange {
    /// Merge this request into the current flag value.
    pub fn apply(self, current: bool) -> bool {
        match self {
            ModeChange::Leave => current,
            ModeChange::Unset => false,
            ModeChange::Set => true,
            ModeChange::Toggle => !current,
        }
    }

    fn to_wire(self) -> i8 {
        match self {
            ModeChange::Leave => -1,
            ModeChange::Unset => 0,
            ModeChange::Set => 1,
            ModeChange::Toggle => 2,
        }
    }

    fn from_wire(raw: i8) -> Result<ModeChange> {
        Ok(match raw {
            -1 => ModeChange::Leave,
            0 => ModeChange::Unset,
            1 => ModeChange::Set,
            2 => ModeChange::Toggle,
            _ => return Err(Error::Protocol(format!("bad mode change {}", raw))),
        })
    }
}

/// Payload of a `Mode` command: one request per flag.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModeRequest {
    pub repeat_one: ModeChange,
    pub repeat_all: ModeChange,
    pub consume: ModeChange,
}

impl ModeRequest {
    pub const WIRE_LEN: usize = 3;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::WIRE_LEN);
        buf.put_i8(self.repeat_one.to_wire());
        buf.put_i8(self.repeat_all.to_wire());
        buf.put_i8(self.consume.to_wire());
        buf.freeze()
    }

    pub fn decode(payload: &Bytes) -> Result<ModeRequest> {
        if payload.len() != Self::WIRE_LEN {
            return Err(Error::Protocol("wrong size".into()));
        }
        let mut b = payload.clone();
        Ok(ModeRequest {
            repeat_one: ModeChange::from_wire(b.get_i8())?,
            repeat_all: ModeChange::from_wire(b.get_i8())?,
            consume: ModeChange::from_wire(b.get_i8())?,
        })
    }
}

/// The three independent playback-mode flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackModes {
    pub repeat_one: bool,
    pub repeat_all: bool,
    pub consume: bool,
}

impl Default for PlaybackModes {
    fn default() -> Self {
        PlaybackModes {
            repeat_one: false,
            repeat_all: true,
            consume: false,
        }
    }
}

impl PlaybackModes {
    /// Apply a merge request to every flag.
    pub fn merge(&mut self, req: ModeRequest) {
        self.repeat_one = req.repeat_one.apply(self.repeat_one);
        self.repeat_all = req.repeat_all.apply(self.repeat_all);
        self.consume = req.consume.apply(self.consume);
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.repeat_one as u8);
        buf.put_u8(self.repeat_all as u8);
        buf.put_u8(self.consume as u8);
    }

    fn get(b: &mut Bytes) -> PlaybackModes {
        PlaybackModes {
            repeat_one: b.get_u8() != 0,
            repeat_all: b.get_u8() != 0,
            consume: b.get_u8() != 0,
        }
    }
}

/// Playback state of the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

impl std::fmt::Display for PlayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlayState::Stopped => write!(f, "stopped"),
            PlayState::Playing => write!(f, "playing"),
            PlayState::Paused => write!(f, "paused"),
        }
    }
}

impl PlayState {
    fn to_wire(self) -> u8 {
        match self {
            PlayState::Stopped => 0,
            PlayState::Playing => 1,
            PlayState::Paused => 2,
        }
    }

    fn from_wire(raw: u8) -> Result<PlayState> {
        Ok(match raw {
            0 => PlayState::Stopped,
            1 => PlayState::Playing,
            2 => PlayState::Paused,
            _ => return Err(Error::Protocol(format!("bad play state {}", raw))),
        })
    }
}

/// Payload of a `Seek` command, forwarded verbatim to the worker.
///
/// `percent` interprets `offset` as a percentage of the track duration;
/// otherwise `offset` is seconds, added to the current position when
/// `relative` is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeekRequest {
    pub offset: i64,
    pub relative: bool,
    pub percent: bool,
}

impl SeekRequest {
    pub const WIRE_LEN: usize = 10;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::WIRE_LEN);
        buf.put_i64_ne(self.offset);
        buf.put_u8(self.relative as u8);
        buf.put_u8(self.percent as u8);
        buf.freeze()
    }

    pub fn decode(payload: &Bytes) -> Result<SeekRequest> {
        if payload.len() != Self::WIRE_LEN {
            return Err(Error::Protocol("wrong size".into()));
        }
        let mut b = payload.clone();
        Ok(SeekRequest {
            offset: b.get_i64_ne(),
            relative: b.get_u8() != 0,
            percent: b.get_u8() != 0,
        })
    }
}

/// Payload of a `MonitorEvent` broadcast: the event that happened plus a
/// snapshot of position, duration, and modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorNote {
    pub event: MsgType,
    pub position: i64,
    pub duration: i64,
    pub modes: PlaybackModes,
}

impl MonitorNote {
    pub const WIRE_LEN: usize = 23;

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::WIRE_LEN);
        buf.put_u32_ne(self.event as u32);
        buf.put_i64_ne(self.position);
        buf.put_i64_ne(self.duration);
        self.modes.put(&mut buf);
        buf.freeze()
    }

    pub fn decode(payload: &Bytes) -> Result<MonitorNote> {
        if payload.len() != Self::WIRE_LEN {
            return Err(Error::Protocol("wrong size".into()));
        }
        let mut b = payload.clone();
        let raw = b.get_u32_ne();
        let event = MsgType::from_u32(raw)
            .ok_or_else(|| Error::Protocol(format!("unknown event type {}", raw)))?;
        Ok(MonitorNote {
            event,
            position: b.get_i64_ne(),
            duration: b.get_i64_ne(),
            modes: PlaybackModes::get(&mut b),
        })
    }
}

/// Payload of a `StatusReply`: full daemon status in one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusInfo {
    pub state: PlayState,
    pub modes: PlaybackModes,
    pub position: i64,
    pub duration: i64,
    /// Current track, empty when nothing is loaded.
    pub path: Option<PathBuf>,
}

impl StatusInfo {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.state.to_wire());
        self.modes.put(&mut buf);
        buf.put_i64_ne(self.position);
        buf.put_i64_ne(self.duration);
        match &self.path {
            Some(p) => frame::put_path(&mut buf, p),
            None => buf.put_u8(0),
        }
        buf.freeze()
    }

    pub fn decode(payload: &Bytes) -> Result<StatusInfo> {
        if payload.len() < 21 {
            return Err(Error::Protocol("wrong size".into()));
        }
        let mut b = payload.clone();
        let state = PlayState::from_wire(b.get_u8())?;
        let modes = PlaybackModes::get(&mut b);
        let position = b.get_i64_ne();
        let duration = b.get_i64_ne();
        let path = frame::take_path(&mut b)?;
        Ok(StatusInfo {
            state,
            modes,
            position,
            duration,
            path: if path.as_os_str().is_empty() {
                None
            } else {
                Some(path)
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_change_merge_rules() {
        assert!(ModeChange::Leave.apply(true));
        assert!(!ModeChange::Leave.apply(false));
        assert!(ModeChange::Set.apply(false));
        assert!(!ModeChange::Unset.apply(true));
        assert!(ModeChange::Toggle.apply(false));
        assert!(!ModeChange::Toggle.apply(true));
    }

    #[test]
    fn merge_all_leave_is_identity() {
        let mut modes = PlaybackModes {
            repeat_one: true,
            repeat_all: false,
            consume: true,
        };
        let before = modes;
        modes.merge(ModeRequest::default());
        assert_eq!(modes, before);
    }

    #[test]
    fn mode_request_roundtrip() {
        let req = ModeRequest {
            repeat_one: ModeChange::Set,
            repeat_all: ModeChange::Toggle,
            consume: ModeChange::Unset,
        };
        let payload = req.encode();
        let back = ModeRequest::decode(&payload).unwrap();
        assert_eq!(back.repeat_one, ModeChange::Set);
        assert_eq!(back.repeat_all, ModeChange::Toggle);
        assert_eq!(back.consume, ModeChange::Unset);
    }

    #[test]
    fn mode_request_wrong_size() {
        let short = Bytes::from_static(&[1, 2]);
        assert!(ModeRequest::decode(&short).is_err());
    }

    #[test]
    fn seek_roundtrip() {
        let req = SeekRequest {
            offset: -30,
            relative: true,
            percent: false,
        };
        assert_eq!(SeekRequest::decode(&req.encode()).unwrap(), req);
    }

    #[test]
    fn monitor_note_roundtrip() {
        let note = MonitorNote {
            event: MsgType::Pause,
            position: 42,
            duration: 180,
            modes: PlaybackModes {
                repeat_one: false,
                repeat_all: true,
                consume: false,
            },
        };
        assert_eq!(MonitorNote::decode(&note.encode()).unwrap(), note);
    }

    #[test]
    fn status_roundtrip() {
        let status = StatusInfo {
            state: PlayState::Playing,
            modes: PlaybackModes::default(),
            position: 12,
            duration: 240,
            path: Some(PathBuf::from("/music/x.flac")),
        };
        assert_eq!(StatusInfo::decode(&status.encode()).unwrap(), status);

        let stopped = StatusInfo {
            state: PlayState::Stopped,
            modes: PlaybackModes::default(),
            position: 0,
            duration: 0,
            path: None,
        };
        assert_eq!(StatusInfo::decode(&stopped.encode()).unwrap(), stopped);
    }
}
