//! End-to-end control socket tests: real unix socket, real framing, the
//! accept loop and connection tasks in front of a live orchestrator.

use bytes::{BufMut, BytesMut};
use canto_common::frame::{self, Frame, MsgType};
use canto_common::proto::{PlayState, StatusInfo};
use cantod::control;
use cantod::daemon::Daemon;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

struct Server {
    _dir: tempfile::TempDir,
    socket: PathBuf,
}

fn start_server() -> Server {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("ctl.sock");

    let listener = control::bind_socket(&socket).unwrap();
    let (daemon_tx, daemon_rx) = mpsc::channel(256);
    let (player_tx, mut player_rx) = mpsc::channel(32);

    // Stub worker: swallow whatever the daemon orders.
    tokio::spawn(async move { while player_rx.recv().await.is_some() {} });

    let mut daemon = Daemon::new(daemon_rx, player_tx);
    tokio::spawn(async move { daemon.run().await });
    tokio::spawn(control::accept_loop(listener, daemon_tx));

    Server { _dir: dir, socket }
}

struct WireClient {
    stream: UnixStream,
    inbuf: BytesMut,
}

impl WireClient {
    async fn connect(socket: &Path) -> WireClient {
        WireClient {
            stream: UnixStream::connect(socket).await.unwrap(),
            inbuf: BytesMut::with_capacity(4096),
        }
    }

    async fn send(&mut self, f: Frame) {
        let mut buf = BytesMut::new();
        f.encode(&mut buf);
        self.stream.write_all(&buf).await.unwrap();
    }

    /// Next frame, or `None` once the server closed the connection.
    async fn recv(&mut self) -> Option<Frame> {
        loop {
            if let Some((f, _)) = frame::decode_one(&mut self.inbuf).unwrap() {
                return Some(f);
            }
            let n = tokio::time::timeout(
                Duration::from_secs(2),
                self.stream.read_buf(&mut self.inbuf),
            )
            .await
            .expect("timed out")
            .expect("read failed");
            if n == 0 {
                return None;
            }
        }
    }

    async fn status(&mut self) -> StatusInfo {
        self.send(Frame::empty(MsgType::Status)).await;
        let reply = self.recv().await.expect("status reply");
        assert_eq!(reply.msg_type, MsgType::StatusReply);
        StatusInfo::decode(&reply.payload).unwrap()
    }

    async fn show(&mut self) -> Vec<PathBuf> {
        self.send(Frame::empty(MsgType::Show)).await;
        let mut entries = Vec::new();
        loop {
            let f = self.recv().await.expect("playlist entry");
            assert_eq!(f.msg_type, MsgType::PlaylistEntry);
            if f.payload.is_empty() {
                return entries;
            }
            let mut payload = f.payload;
            entries.push(frame::take_path(&mut payload).unwrap());
        }
    }
}

fn add_frame(path: &str) -> Frame {
    let mut payload = BytesMut::new();
    frame::put_cstr(&mut payload, path);
    Frame::new(MsgType::Add, payload.freeze())
}

#[tokio::test]
async fn add_show_status_over_the_socket() {
    let server = start_server();
    let mut client = WireClient::connect(&server.socket).await;

    client.send(add_frame("/music/a.ogg")).await;
    client.send(add_frame("/music/b.ogg")).await;

    assert_eq!(
        client.show().await,
        vec![PathBuf::from("/music/a.ogg"), PathBuf::from("/music/b.ogg")]
    );

    let status = client.status().await;
    assert_eq!(status.state, PlayState::Stopped);
    assert_eq!(status.path, None);
    assert!(status.modes.repeat_all);
}

#[tokio::test]
async fn monitor_sees_other_clients_mutations() {
    let server = start_server();
    let mut monitor = WireClient::connect(&server.socket).await;
    let mut other = WireClient::connect(&server.socket).await;

    monitor.send(Frame::empty(MsgType::Monitor)).await;
    // Round-trip through the daemon so the monitor flag is set before
    // the mutation below.
    monitor.status().await;

    other.send(add_frame("/music/a.ogg")).await;

    let event = monitor.recv().await.expect("monitor event");
    assert_eq!(event.msg_type, MsgType::MonitorEvent);
    let note = canto_common::proto::MonitorNote::decode(&event.payload).unwrap();
    assert_eq!(note.event, MsgType::Add);
}

#[tokio::test]
async fn transactions_work_across_the_socket() {
    let server = start_server();
    let mut a = WireClient::connect(&server.socket).await;
    let mut b = WireClient::connect(&server.socket).await;

    a.send(Frame::empty(MsgType::Begin)).await;
    assert_eq!(a.recv().await.unwrap().msg_type, MsgType::Begin);

    a.send(add_frame("/x")).await;
    assert!(b.show().await.is_empty());

    let mut payload = BytesMut::with_capacity(8);
    payload.put_i64_ne(-1);
    a.send(Frame::new(MsgType::Commit, payload.freeze())).await;
    assert_eq!(a.recv().await.unwrap().msg_type, MsgType::Commit);

    assert_eq!(b.show().await, vec![PathBuf::from("/x")]);
}

#[tokio::test]
async fn dropping_mid_transaction_releases_the_lock() {
    let server = start_server();

    {
        let mut a = WireClient::connect(&server.socket).await;
        a.send(Frame::empty(MsgType::Begin)).await;
        assert_eq!(a.recv().await.unwrap().msg_type, MsgType::Begin);
        a.send(add_frame("/p")).await;
        // Flush the add through the daemon before dropping abruptly.
        a.status().await;
    }

    // Give the reader task a moment to notice the hangup.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut c = WireClient::connect(&server.socket).await;
    assert!(c.show().await.is_empty());
    c.send(Frame::empty(MsgType::Begin)).await;
    assert_eq!(c.recv().await.unwrap().msg_type, MsgType::Begin);
}

#[tokio::test]
async fn garbage_closes_the_connection() {
    let server = start_server();
    let mut client = WireClient::connect(&server.socket).await;

    // A header claiming an unknown message type.
    let mut buf = BytesMut::new();
    buf.put_u16_ne(frame::HEADER_LEN as u16);
    buf.put_u16_ne(0);
    buf.put_u32_ne(0xdead);
    buf.put_u32_ne(0);
    buf.put_u32_ne(0);
    client.stream.write_all(&buf).await.unwrap();

    assert!(client.recv().await.is_none(), "server should close on garbage");

    // The daemon survives: a new client is served normally.
    let mut fresh = WireClient::connect(&server.socket).await;
    assert_eq!(fresh.status().await.state, PlayState::Stopped);
}

#[tokio::test]
async fn socket_is_user_and_group_only() {
    let server = start_server();
    let mode = std::fs::metadata(&server.socket).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o660);
}
