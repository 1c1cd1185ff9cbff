//! Test harness: an orchestrator wired to channel-backed clients and a
//! stubbed player link, plus frame builders and reply collectors.

#![allow(dead_code)]

use bytes::BytesMut;
use canto_common::frame::{self, Frame, MsgType};
use canto_common::proto::{ModeChange, ModeRequest, MonitorNote, SeekRequest, StatusInfo};
use cantod::daemon::{ConnId, Daemon, DaemonMsg, Exit, PlayerCmd, PlayerEvent};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

pub struct TestDaemon {
    pub tx: mpsc::Sender<DaemonMsg>,
    pub player_rx: mpsc::Receiver<PlayerCmd>,
    pub handle: tokio::task::JoinHandle<Exit>,
}

pub struct Client {
    pub id: ConnId,
    pub rx: mpsc::Receiver<Frame>,
}

pub fn start_daemon() -> TestDaemon {
    let (tx, rx) = mpsc::channel(256);
    let (player_tx, player_rx) = mpsc::channel(32);
    let mut daemon = Daemon::new(rx, player_tx);
    let handle = tokio::spawn(async move { daemon.run().await });
    TestDaemon {
        tx,
        player_rx,
        handle,
    }
}

impl TestDaemon {
    pub async fn connect(&self, id: u64) -> Client {
        let (ctx, crx) = mpsc::channel(1024);
        self.tx
            .send(DaemonMsg::Connected {
                id: ConnId(id),
                pid: 1000 + id as u32,
                tx: ctx,
            })
            .await
            .unwrap();
        Client {
            id: ConnId(id),
            rx: crx,
        }
    }

    pub async fn disconnect(&self, client: &Client) {
        self.tx
            .send(DaemonMsg::Disconnected { id: client.id })
            .await
            .unwrap();
    }

    pub async fn request(&self, client: &Client, frame: Frame) {
        self.tx
            .send(DaemonMsg::Request {
                id: client.id,
                frame,
            })
            .await
            .unwrap();
    }

    pub async fn player_event(&self, ev: PlayerEvent) {
        self.tx.send(DaemonMsg::Player(ev)).await.unwrap();
    }

    /// Expect the next player command to be `Open` and return its path.
    pub async fn expect_open(&mut self) -> PathBuf {
        match recv_player(&mut self.player_rx).await {
            PlayerCmd::Open { path, .. } => path,
            other => panic!("expected Open, got {:?}", other),
        }
    }

    pub async fn expect_player_stop(&mut self) {
        match recv_player(&mut self.player_rx).await {
            PlayerCmd::Stop => {}
            other => panic!("expected Stop, got {:?}", other),
        }
    }

    /// Ask for status and decode the reply.
    pub async fn status(&self, client: &mut Client) -> StatusInfo {
        self.request(client, Frame::empty(MsgType::Status)).await;
        let reply = recv_frame(&mut client.rx).await;
        assert_eq!(reply.msg_type, MsgType::StatusReply);
        StatusInfo::decode(&reply.payload).unwrap()
    }

    /// Ask for the playlist and collect entries until the terminator.
    pub async fn show(&self, client: &mut Client) -> Vec<PathBuf> {
        self.request(client, Frame::empty(MsgType::Show)).await;
        let mut entries = Vec::new();
        loop {
            let f = recv_frame(&mut client.rx).await;
            assert_eq!(f.msg_type, MsgType::PlaylistEntry);
            if f.payload.is_empty() {
                return entries;
            }
            let mut payload = f.payload;
            entries.push(frame::take_path(&mut payload).unwrap());
        }
    }
}

pub async fn recv_frame(rx: &mut mpsc::Receiver<Frame>) -> Frame {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a frame")
        .expect("connection channel closed")
}

pub async fn expect_no_frame(rx: &mut mpsc::Receiver<Frame>) {
    match tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
        Err(_) => {}
        Ok(Some(f)) => panic!("unexpected frame {:?}", f.msg_type),
        Ok(None) => {}
    }
}

pub async fn recv_player(rx: &mut mpsc::Receiver<PlayerCmd>) -> PlayerCmd {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a player command")
        .expect("player channel closed")
}

/// Expect a `MonitorEvent` frame and decode it.
pub async fn recv_event(rx: &mut mpsc::Receiver<Frame>) -> MonitorNote {
    let f = recv_frame(rx).await;
    assert_eq!(f.msg_type, MsgType::MonitorEvent);
    MonitorNote::decode(&f.payload).unwrap()
}

pub async fn recv_error(rx: &mut mpsc::Receiver<Frame>) -> String {
    let f = recv_frame(rx).await;
    assert_eq!(f.msg_type, MsgType::Error);
    let mut payload = f.payload;
    frame::take_cstr(&mut payload).unwrap()
}

// ========================================
// Frame builders
// ========================================

pub fn add_frame(path: &Path) -> Frame {
    let mut payload = BytesMut::new();
    frame::put_path(&mut payload, path);
    Frame::new(MsgType::Add, payload.freeze())
}

pub fn jump_frame(path: &Path) -> Frame {
    let mut payload = BytesMut::new();
    frame::put_path(&mut payload, path);
    Frame::new(MsgType::Jump, payload.freeze())
}

pub fn commit_frame(offset: i64) -> Frame {
    use bytes::BufMut;
    let mut payload = BytesMut::with_capacity(8);
    payload.put_i64_ne(offset);
    Frame::new(MsgType::Commit, payload.freeze())
}

pub fn mode_frame(repeat_one: ModeChange, repeat_all: ModeChange, consume: ModeChange) -> Frame {
    let req = ModeRequest {
        repeat_one,
        repeat_all,
        consume,
    };
    Frame::new(MsgType::Mode, req.encode())
}

pub fn seek_frame(offset: i64, relative: bool, percent: bool) -> Frame {
    let req = SeekRequest {
        offset,
        relative,
        percent,
    };
    Frame::new(MsgType::Seek, req.encode())
}

/// Real (empty) track files the daemon can open for the worker.
pub fn track_files(names: &[&str]) -> (tempfile::TempDir, Vec<PathBuf>) {
    let dir = tempfile::tempdir().unwrap();
    let paths = names
        .iter()
        .map(|n| {
            let p = dir.path().join(n);
            std::fs::write(&p, b"not really audio").unwrap();
            p
        })
        .collect();
    (dir, paths)
}
