//! The orchestrator: canonical state and command dispatch.
//!
//! One task owns the playlist, play state, modes, transaction, and the
//! connection table. It consumes control-endpoint commands and player
//! events from a single mpsc channel, so every handler runs as one
//! atomic turn; replies and broadcasts are enqueued on per-connection
//! output channels, never sent synchronously.

use crate::playlist::Playlist;
use canto_common::frame::{self, Frame, MsgType};
use canto_common::proto::{
    ModeRequest, MonitorNote, PlayState, PlaybackModes, SeekRequest, StatusInfo,
};
use bytes::{Buf, BytesMut};
use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Generation-tagged connection id. Never reused within a daemon run, so
/// a stale id (say, a transaction owner that disconnected) can never
/// alias a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

/// Everything the orchestrator consumes, from all sources.
#[derive(Debug)]
pub enum DaemonMsg {
    /// A client connected to the control socket.
    Connected {
        id: ConnId,
        pid: u32,
        tx: mpsc::Sender<Frame>,
    },
    /// A client connection ended (EOF, read or write error).
    Disconnected { id: ConnId },
    /// One decoded client frame, pid already stamped from peer creds.
    Request { id: ConnId, frame: Frame },
    /// Lifecycle event from the player worker.
    Player(PlayerEvent),
    /// Graceful shutdown requested (SIGTERM/SIGINT).
    Shutdown,
}

/// Events reported by the worker link.
#[derive(Debug)]
pub enum PlayerEvent {
    /// The current track finished decoding.
    Done,
    /// The worker could not play the current track.
    Failed(String),
    /// Playback position in seconds.
    Position(i64),
    /// Track duration in seconds.
    Length(i64),
    /// The worker died and a replacement is running.
    Restarted,
    /// The worker died and could not be respawned.
    Lost,
}

/// Orders sent to the worker link.
#[derive(Debug)]
pub enum PlayerCmd {
    /// Start a track; the open file crosses the link as a passed fd.
    Open { file: File, path: PathBuf },
    Resume,
    Pause,
    Stop,
    Seek(SeekRequest),
    /// Tear down the worker for daemon shutdown.
    Shutdown,
}

/// Why the orchestrator returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Clean shutdown; process exits 0.
    Shutdown,
    /// The worker is gone for good; process exits 2.
    WorkerLost,
}

struct Connection {
    pid: u32,
    monitor: bool,
    tx: mpsc::Sender<Frame>,
}

/// At most one transaction across all clients.
#[derive(Default)]
struct Transaction {
    owner: Option<ConnId>,
    staged: Vec<PathBuf>,
}

pub struct Daemon {
    rx: mpsc::Receiver<DaemonMsg>,
    player: mpsc::Sender<PlayerCmd>,
    playlist: Playlist,
    modes: PlaybackModes,
    state: PlayState,
    position: i64,
    duration: i64,
    conns: HashMap<ConnId, Connection>,
    txn: Transaction,
}

impl Daemon {
    pub fn new(rx: mpsc::Receiver<DaemonMsg>, player: mpsc::Sender<PlayerCmd>) -> Daemon {
        Daemon {
            rx,
            player,
            playlist: Playlist::new(),
            modes: PlaybackModes::default(),
            state: PlayState::Stopped,
            position: 0,
            duration: 0,
            conns: HashMap::new(),
            txn: Transaction::default(),
        }
    }

    /// Install a restored playlist snapshot before the loop starts.
    pub fn restore(&mut self, songs: Vec<PathBuf>, cursor: Option<usize>) {
        info!(entries = songs.len(), "restoring playlist snapshot");
        self.playlist = Playlist::from_parts(songs, cursor);
    }

    /// Current playlist contents and cursor, for the shutdown snapshot.
    pub fn snapshot(&self) -> (Vec<PathBuf>, Option<usize>) {
        (self.playlist.songs().to_vec(), self.playlist.cursor())
    }

    /// Run until shutdown or worker loss.
    pub async fn run(&mut self) -> Exit {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                DaemonMsg::Connected { id, pid, tx } => {
                    debug!(?id, pid, "client connected");
                    self.conns.insert(
                        id,
                        Connection {
                            pid,
                            monitor: false,
                            tx,
                        },
                    );
                }
                DaemonMsg::Disconnected { id } => self.close_conn(id),
                DaemonMsg::Request { id, frame } => self.dispatch(id, frame),
                DaemonMsg::Player(ev) => {
                    if let Some(exit) = self.on_player_event(ev) {
                        return exit;
                    }
                }
                DaemonMsg::Shutdown => {
                    info!("shutting down");
                    self.send_player(PlayerCmd::Stop);
                    self.send_player(PlayerCmd::Shutdown);
                    // Dropping the senders lets the connection writers
                    // drain whatever is queued and finish.
                    self.conns.clear();
                    return Exit::Shutdown;
                }
            }
        }
        Exit::Shutdown
    }

    // ========================================
    // Client command dispatch
    // ========================================

    fn dispatch(&mut self, id: ConnId, frame: Frame) {
        if !self.conns.contains_key(&id) {
            return;
        }
        debug!(?id, msg = ?frame.msg_type, "dispatch");

        match frame.msg_type {
            MsgType::Play => {
                match self.state {
                    PlayState::Stopped => self.resume_playlist(),
                    PlayState::Playing => {}
                    PlayState::Paused => {
                        self.state = PlayState::Playing;
                        self.send_player(PlayerCmd::Resume);
                    }
                }
                self.notify(MsgType::Play);
            }
            MsgType::TogglePlay => match self.state {
                PlayState::Stopped => {
                    self.notify(MsgType::Play);
                    self.resume_playlist();
                }
                PlayState::Playing => {
                    self.notify(MsgType::Pause);
                    self.state = PlayState::Paused;
                    self.send_player(PlayerCmd::Pause);
                }
                PlayState::Paused => {
                    self.notify(MsgType::Play);
                    self.state = PlayState::Playing;
                    self.send_player(PlayerCmd::Resume);
                }
            },
            MsgType::Pause => {
                if self.state == PlayState::Playing {
                    self.state = PlayState::Paused;
                    self.send_player(PlayerCmd::Pause);
                    self.notify(MsgType::Pause);
                }
            }
            MsgType::Stop => {
                if self.state != PlayState::Stopped {
                    self.state = PlayState::Stopped;
                    self.send_player(PlayerCmd::Stop);
                    self.notify(MsgType::Stop);
                }
            }
            MsgType::Next => {
                self.notify(MsgType::Next);
                self.send_player(PlayerCmd::Stop);
                self.skip_forward();
            }
            MsgType::Prev => {
                self.notify(MsgType::Prev);
                self.send_player(PlayerCmd::Stop);
                if self.playlist.previous().is_some() {
                    self.start_current();
                } else {
                    self.state = PlayState::Stopped;
                }
            }
            MsgType::Jump => {
                let mut payload = frame.payload;
                let Ok(target) = frame::take_path(&mut payload) else {
                    self.send_error(id, "bad jump payload");
                    return;
                };
                if self.playlist.jump_to(&target).is_some() {
                    self.notify(MsgType::Jump);
                    self.send_player(PlayerCmd::Stop);
                    self.start_current();
                } else {
                    self.send_error(id, "not found");
                }
            }
            MsgType::Seek => {
                let seek = match SeekRequest::decode(&frame.payload) {
                    Ok(s) => s,
                    Err(_) => {
                        self.send_error(id, "wrong size");
                        return;
                    }
                };
                if self.state != PlayState::Stopped {
                    self.send_player(PlayerCmd::Seek(seek));
                }
            }
            MsgType::Mode => {
                let req = match ModeRequest::decode(&frame.payload) {
                    Ok(r) => r,
                    Err(_) => {
                        warn!(?id, "mode request with wrong size");
                        return;
                    }
                };
                self.modes.merge(req);
                self.notify(MsgType::Mode);
            }
            MsgType::Flush => {
                self.playlist.truncate();
                if self.state != PlayState::Stopped {
                    self.state = PlayState::Stopped;
                    self.send_player(PlayerCmd::Stop);
                }
                self.notify(MsgType::Commit);
            }
            MsgType::Show => self.send_playlist(id),
            MsgType::Status => self.send_status(id),
            MsgType::Monitor => {
                if let Some(conn) = self.conns.get_mut(&id) {
                    conn.monitor = true;
                }
            }
            MsgType::Begin => {
                if self.txn.owner.is_some() {
                    self.send_error(id, "locked");
                    return;
                }
                self.txn.owner = Some(id);
                self.txn.staged.clear();
                self.send_to(id, Frame::empty(MsgType::Begin));
            }
            MsgType::Add => {
                if self.txn.owner.is_some() && self.txn.owner != Some(id) {
                    self.send_error(id, "locked");
                    return;
                }
                let mut payload = frame.payload;
                let Ok(path) = frame::take_path(&mut payload) else {
                    self.send_error(id, "bad add payload");
                    return;
                };
                if self.txn.owner == Some(id) {
                    self.txn.staged.push(path);
                } else {
                    self.playlist.enqueue(path);
                    self.notify(MsgType::Add);
                }
            }
            MsgType::Commit => {
                if self.txn.owner != Some(id) {
                    self.send_error(id, "locked");
                    return;
                }
                if frame.payload.len() != 8 {
                    self.send_error(id, "wrong size");
                    return;
                }
                let offset = frame.payload.clone().get_i64_ne();
                let staged = std::mem::take(&mut self.txn.staged);
                self.txn.owner = None;
                if self.playlist.splice(staged, offset) && self.state != PlayState::Stopped {
                    self.state = PlayState::Stopped;
                    self.send_player(PlayerCmd::Stop);
                }
                self.send_to(id, Frame::empty(MsgType::Commit));
                self.notify(MsgType::Commit);
            }
            other => {
                // Not a client command: protocol violation.
                warn!(?id, msg = ?other, "unexpected message from client");
                self.close_conn(id);
            }
        }
    }

    // ========================================
    // Player events
    // ========================================

    fn on_player_event(&mut self, ev: PlayerEvent) -> Option<Exit> {
        match ev {
            PlayerEvent::Position(secs) => self.position = secs,
            PlayerEvent::Length(secs) => self.duration = secs,
            PlayerEvent::Done => self.on_track_done(false),
            PlayerEvent::Failed(err) => {
                warn!(error = %err, "worker reported track failure");
                self.on_track_done(true);
            }
            PlayerEvent::Restarted => {
                warn!("worker restarted");
                if self.state != PlayState::Stopped {
                    // Whatever was playing died with the old worker.
                    self.on_track_done(true);
                }
            }
            PlayerEvent::Lost => return Some(Exit::WorkerLost),
        }
        None
    }

    /// Playlist advancement after a track ends.
    fn on_track_done(&mut self, errored: bool) {
        if errored {
            self.notify(MsgType::Error);
        }
        if self.state == PlayState::Stopped {
            return;
        }
        if self.modes.consume {
            self.playlist.drop_current();
            if self.playlist.current().is_none() {
                if self.modes.repeat_all && !self.playlist.is_empty() {
                    self.playlist.rewind();
                } else {
                    self.enter_stopped_at_end();
                    return;
                }
            }
            self.notify(MsgType::Next);
            self.start_current();
        } else if self.modes.repeat_one {
            self.start_current();
        } else if self.playlist.advance(self.modes.repeat_all).is_some() {
            self.notify(MsgType::Next);
            self.start_current();
        } else {
            self.enter_stopped_at_end();
        }
    }

    fn enter_stopped_at_end(&mut self) {
        self.state = PlayState::Stopped;
        self.notify(MsgType::Next);
        self.notify(MsgType::Stop);
    }

    /// Skip forward on user request: consume drops the current entry,
    /// repeat_one never holds an explicit skip. Running off the end of a
    /// non-repeating playlist stops, and monitors hear about it.
    fn skip_forward(&mut self) {
        let was_active = self.state != PlayState::Stopped;
        if self.modes.consume {
            self.playlist.drop_current();
            if self.playlist.current().is_none() {
                if self.modes.repeat_all && !self.playlist.is_empty() {
                    self.playlist.rewind();
                } else {
                    self.stop_after_skip(was_active);
                    return;
                }
            }
            self.start_current();
        } else if self.playlist.advance(self.modes.repeat_all).is_some() {
            self.start_current();
        } else {
            self.stop_after_skip(was_active);
        }
    }

    /// A skip landed in Stopped. The Next/Prev event already went out
    /// from the dispatcher, so only the stop transition is announced
    /// here, and only when there was one.
    fn stop_after_skip(&mut self, was_active: bool) {
        self.state = PlayState::Stopped;
        if was_active {
            self.notify(MsgType::Stop);
        }
    }

    /// Resume from Stopped: pick up at the cursor, or from the top.
    fn resume_playlist(&mut self) {
        if self.playlist.current().is_none() {
            self.playlist.advance(self.modes.repeat_all);
        }
        self.start_current();
    }

    /// Open the entry under the cursor and hand it to the worker. Tracks
    /// that fail to open are skipped with an error broadcast; a full
    /// cycle of failures stops playback instead of spinning.
    fn start_current(&mut self) {
        let mut attempts = self.playlist.len();
        loop {
            let Some(path) = self.playlist.current().map(Path::to_path_buf) else {
                self.state = PlayState::Stopped;
                return;
            };
            match open_track(&path) {
                Ok(file) => {
                    info!(path = %path.display(), "starting track");
                    self.position = 0;
                    self.duration = 0;
                    self.state = PlayState::Playing;
                    self.send_player(PlayerCmd::Open { file, path });
                    return;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot open track, skipping");
                    self.notify(MsgType::Error);
                    attempts = attempts.saturating_sub(1);
                    if attempts == 0 || self.playlist.advance(self.modes.repeat_all).is_none() {
                        self.state = PlayState::Stopped;
                        self.notify(MsgType::Stop);
                        return;
                    }
                }
            }
        }
    }

    // ========================================
    // Replies and broadcasts
    // ========================================

    /// Stream the playlist to one client, one frame per entry, then an
    /// empty terminator frame.
    fn send_playlist(&mut self, id: ConnId) {
        let frames: Vec<Frame> = self
            .playlist
            .songs()
            .iter()
            .map(|path| {
                let mut payload = BytesMut::new();
                frame::put_path(&mut payload, path);
                Frame::new(MsgType::PlaylistEntry, payload.freeze())
            })
            .chain(std::iter::once(Frame::empty(MsgType::PlaylistEntry)))
            .collect();
        for f in frames {
            if !self.send_to(id, f) {
                break;
            }
        }
    }

    fn send_status(&mut self, id: ConnId) {
        let info = StatusInfo {
            state: self.state,
            modes: self.modes,
            position: self.position,
            duration: self.duration,
            path: self.playlist.current().map(Path::to_path_buf),
        };
        self.send_to(id, Frame::new(MsgType::StatusReply, info.encode()));
    }

    fn send_error(&mut self, id: ConnId, msg: &str) {
        self.send_to(id, Frame::error(msg));
    }

    /// Enqueue a frame on one connection. A full or closed output queue
    /// closes the connection. Returns false when the connection is gone.
    fn send_to(&mut self, id: ConnId, frame: Frame) -> bool {
        let Some(conn) = self.conns.get(&id) else {
            return false;
        };
        if conn.tx.try_send(frame).is_err() {
            warn!(?id, "output queue overflow, closing connection");
            self.close_conn(id);
            return false;
        }
        true
    }

    /// Broadcast one state-change event to every monitoring connection.
    fn notify(&mut self, event: MsgType) {
        let note = MonitorNote {
            event,
            position: self.position,
            duration: self.duration,
            modes: self.modes,
        };
        let targets: Vec<ConnId> = self
            .conns
            .iter()
            .filter(|(_, c)| c.monitor)
            .map(|(&id, _)| id)
            .collect();
        for id in targets {
            self.send_to(id, Frame::new(MsgType::MonitorEvent, note.encode()));
        }
    }

    fn send_player(&self, cmd: PlayerCmd) {
        if self.player.try_send(cmd).is_err() {
            warn!("player command queue unavailable");
        }
    }

    /// Drop a connection and roll back its transaction, if it held one.
    fn close_conn(&mut self, id: ConnId) {
        let Some(conn) = self.conns.remove(&id) else {
            return;
        };
        debug!(?id, pid = conn.pid, "client disconnected");
        if self.txn.owner == Some(id) {
            info!(?id, staged = self.txn.staged.len(), "rolling back transaction");
            self.txn.owner = None;
            self.txn.staged.clear();
        }
    }
}

/// Open a playlist entry for the worker: read-only, close-on-exec.
fn open_track(path: &Path) -> std::io::Result<File> {
    std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_CLOEXEC)
        .open(path)
}
