//! Control endpoint: the filesystem socket clients talk to.
//!
//! Socket discipline: stale socket files are unlinked, the bind runs
//! under a umask that strips world and execute bits, and the result is
//! chmod'd 0660. The accept loop pauses for one second when the process
//! runs out of file descriptors; that pause is the only backpressure
//! against fd exhaustion and no client ever sees an error from it.

use crate::daemon::{ConnId, DaemonMsg};
use canto_common::frame::{self, Frame};
use bytes::BytesMut;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const BACKLOG: libc::c_int = 5;

/// Frames a connection may have queued before it is considered too slow
/// and closed.
const OUTPUT_QUEUE: usize = 1024;

/// Bind the control socket with 0660 permissions.
pub fn bind_socket(path: &Path) -> io::Result<UnixListener> {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let old_umask = unsafe { libc::umask(0o117) };
    let listener = UnixListener::bind(path);
    unsafe { libc::umask(old_umask) };
    let listener = listener?;

    fs::set_permissions(path, fs::Permissions::from_mode(0o660))?;

    // Shrink the kernel backlog to the configured small value.
    unsafe {
        use std::os::fd::AsRawFd;
        libc::listen(listener.as_raw_fd(), BACKLOG);
    }

    info!(path = %path.display(), "control socket ready");
    Ok(listener)
}

/// Accept clients forever, spawning a reader/writer pair per connection.
pub async fn accept_loop(listener: UnixListener, daemon: mpsc::Sender<DaemonMsg>) {
    let mut next_id: u64 = 1;
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let id = ConnId(next_id);
                next_id += 1;
                tokio::spawn(serve_connection(id, stream, daemon.clone()));
            }
            Err(e) if out_of_fds(&e) => {
                warn!("file descriptors exhausted, pausing accept for 1s");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::Interrupted
                        | io::ErrorKind::WouldBlock
                ) => {}
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
}

fn out_of_fds(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}

/// One client connection: decode inbound frames into daemon requests,
/// write queued outbound frames back. Any protocol violation, read
/// error, or write error ends the connection.
async fn serve_connection(id: ConnId, stream: UnixStream, daemon: mpsc::Sender<DaemonMsg>) {
    let cred = stream.peer_cred().ok();
    let pid = cred
        .as_ref()
        .and_then(|c| c.pid())
        .map(|p| p as u32)
        .unwrap_or(0);
    let uid = cred.as_ref().map(|c| c.uid()).unwrap_or(0);

    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(OUTPUT_QUEUE);
    if daemon
        .send(DaemonMsg::Connected { id, pid, tx: out_tx })
        .await
        .is_err()
    {
        return;
    }

    let (mut rd, mut wr) = stream.into_split();

    // Writer: drains the output queue until the daemon drops the sender.
    let daemon_w = daemon.clone();
    tokio::spawn(async move {
        let mut buf = BytesMut::new();
        while let Some(f) = out_rx.recv().await {
            f.encode(&mut buf);
            while let Ok(more) = out_rx.try_recv() {
                more.encode(&mut buf);
            }
            if wr.write_all(&buf).await.is_err() {
                let _ = daemon_w.send(DaemonMsg::Disconnected { id }).await;
                return;
            }
            buf.clear();
        }
        let _ = wr.shutdown().await;
    });

    let mut inbuf = BytesMut::with_capacity(4096);
    let why = loop {
        // Dispatch everything already buffered before reading more.
        match frame::decode_one(&mut inbuf) {
            Ok(Some((mut f, wants_fd))) => {
                if wants_fd {
                    break "client flagged an fd";
                }
                f.pid = pid;
                f.uid = uid;
                if daemon
                    .send(DaemonMsg::Request { id, frame: f })
                    .await
                    .is_err()
                {
                    return;
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(?id, error = %e, "closing connection");
                break "protocol error";
            }
        }
        match rd.read_buf(&mut inbuf).await {
            Ok(0) => break "eof",
            Ok(_) => {}
            Err(_) => break "read error",
        }
    };

    debug!(?id, why, "connection done");
    let _ = daemon.send(DaemonMsg::Disconnected { id }).await;
}
