//! Worker supervision and the privileged player link.
//!
//! The daemon talks to `canto-player` over a pre-created socketpair; the
//! worker's end becomes its stdin. Orders flow down as frames (`Open`
//! carries the track's file descriptor via `SCM_RIGHTS`), lifecycle
//! events flow back up. When the worker dies the link respawns it and
//! tells the orchestrator; when a respawn fails, the daemon gives up
//! with exit code 2.

use crate::daemon::{DaemonMsg, PlayerCmd, PlayerEvent};
use canto_common::frame::{self, Frame, MsgType};
use bytes::{Buf, BytesMut};
use sendfd::SendWithFd;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Spawn the worker and the link task serving it.
pub fn spawn_link(
    daemon: mpsc::Sender<DaemonMsg>,
    device: Option<String>,
    verbose: bool,
) -> anyhow::Result<(mpsc::Sender<PlayerCmd>, tokio::task::JoinHandle<()>)> {
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let worker = spawn_worker(device.as_deref(), verbose)?;
    let handle = tokio::spawn(link_task(worker, cmd_rx, daemon, device, verbose));
    Ok((cmd_tx, handle))
}

struct Worker {
    child: Child,
    stream: UnixStream,
}

fn spawn_worker(device: Option<&str>, verbose: bool) -> anyhow::Result<Worker> {
    let (ours, theirs) = StdUnixStream::pair()?;
    ours.set_nonblocking(true)?;
    let stream = UnixStream::from_std(ours)?;

    let mut cmd = Command::new(worker_binary());
    cmd.stdin(Stdio::from(OwnedFd::from(theirs)));
    if verbose {
        cmd.arg("--verbose");
    }
    if let Some(dev) = device {
        cmd.arg("--device").arg(dev);
    }
    cmd.kill_on_drop(true);

    let child = cmd.spawn()?;
    info!(pid = child.id(), "player worker spawned");
    Ok(Worker { child, stream })
}

/// The worker binary lives next to the daemon binary during development
/// and in PATH when installed.
fn worker_binary() -> PathBuf {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let sibling = dir.join("canto-player");
            if sibling.exists() {
                return sibling;
            }
        }
    }
    PathBuf::from("canto-player")
}

/// A worker dying this soon after spawn counts as a crash loop.
const QUICK_DEATH: std::time::Duration = std::time::Duration::from_secs(1);
const MAX_QUICK_DEATHS: u32 = 3;

async fn link_task(
    mut worker: Worker,
    mut cmd_rx: mpsc::Receiver<PlayerCmd>,
    daemon: mpsc::Sender<DaemonMsg>,
    device: Option<String>,
    verbose: bool,
) {
    let mut inbuf = BytesMut::with_capacity(4096);
    let mut spawned_at = std::time::Instant::now();
    let mut quick_deaths = 0u32;
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                None | Some(PlayerCmd::Shutdown) => {
                    debug!("tearing down player worker");
                    let _ = worker.child.start_kill();
                    let _ = worker.child.wait().await;
                    return;
                }
                Some(cmd) => {
                    if let Err(e) = send_cmd(&worker.stream, cmd).await {
                        // The read side will notice the death and respawn.
                        warn!(error = %e, "write to worker failed");
                    }
                }
            },
            ready = worker.stream.readable() => {
                if ready.is_err() || !pump_events(&worker.stream, &mut inbuf, &daemon).await {
                    let status = worker.child.wait().await;
                    warn!(?status, "player worker died");
                    inbuf.clear();

                    if spawned_at.elapsed() < QUICK_DEATH {
                        quick_deaths += 1;
                    } else {
                        quick_deaths = 0;
                    }
                    if quick_deaths >= MAX_QUICK_DEATHS {
                        error!("player worker is crash-looping, giving up");
                        let _ = daemon.send(DaemonMsg::Player(PlayerEvent::Lost)).await;
                        return;
                    }

                    match spawn_worker(device.as_deref(), verbose) {
                        Ok(w) => {
                            worker = w;
                            spawned_at = std::time::Instant::now();
                            if daemon.send(DaemonMsg::Player(PlayerEvent::Restarted)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "cannot respawn player worker");
                            let _ = daemon.send(DaemonMsg::Player(PlayerEvent::Lost)).await;
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Read whatever the worker has to say; false means the stream is dead.
async fn pump_events(
    stream: &UnixStream,
    inbuf: &mut BytesMut,
    daemon: &mpsc::Sender<DaemonMsg>,
) -> bool {
    let mut chunk = [0u8; 4096];
    match stream.try_read(&mut chunk) {
        Ok(0) => return false,
        Ok(n) => inbuf.extend_from_slice(&chunk[..n]),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
        Err(_) => return false,
    }

    loop {
        match frame::decode_one(inbuf) {
            Ok(Some((f, _))) => {
                if let Some(ev) = decode_event(f) {
                    if daemon.send(DaemonMsg::Player(ev)).await.is_err() {
                        return false;
                    }
                }
            }
            Ok(None) => return true,
            Err(e) => {
                warn!(error = %e, "garbage from worker");
                return false;
            }
        }
    }
}

fn decode_event(f: Frame) -> Option<PlayerEvent> {
    match f.msg_type {
        MsgType::Done => Some(PlayerEvent::Done),
        MsgType::Error => {
            let mut payload = f.payload;
            let msg = frame::take_cstr(&mut payload).unwrap_or_else(|_| "unknown".into());
            Some(PlayerEvent::Failed(msg))
        }
        MsgType::Position if f.payload.len() == 8 => {
            Some(PlayerEvent::Position(f.payload.clone().get_i64_ne()))
        }
        MsgType::Length if f.payload.len() == 8 => {
            Some(PlayerEvent::Length(f.payload.clone().get_i64_ne()))
        }
        other => {
            warn!(msg = ?other, "unexpected message from worker");
            None
        }
    }
}

async fn send_cmd(stream: &UnixStream, cmd: PlayerCmd) -> io::Result<()> {
    let frame = match cmd {
        PlayerCmd::Open { file, path } => {
            let mut payload = BytesMut::new();
            frame::put_path(&mut payload, &path);
            Frame::new(MsgType::Open, payload.freeze()).with_fd(OwnedFd::from(file))
        }
        PlayerCmd::Resume => Frame::empty(MsgType::Resume),
        PlayerCmd::Pause => Frame::empty(MsgType::Pause),
        PlayerCmd::Stop => Frame::empty(MsgType::Stop),
        PlayerCmd::Seek(req) => Frame::new(MsgType::Seek, req.encode()),
        PlayerCmd::Shutdown => return Ok(()),
    };

    let mut buf = BytesMut::with_capacity(frame.wire_len());
    frame.encode(&mut buf);

    // The fd rides the first written byte; after that it must not be
    // sent again.
    let mut pending_fd: Option<RawFd> = frame.fd.as_ref().map(|fd| fd.as_raw_fd());
    let mut off = 0;
    while off < buf.len() {
        stream.writable().await?;
        let res = match pending_fd {
            Some(raw) => stream.send_with_fd(&buf[off..], &[raw]),
            None => stream.send_with_fd(&buf[off..], &[]),
        };
        match res {
            Ok(n) => {
                off += n;
                if n > 0 {
                    pending_fd = None;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    // The fd, if any, was duplicated into the worker by sendmsg; our
    // copy drops here, completing the ownership handoff.
    Ok(())
}
