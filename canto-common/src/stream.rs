//! Blocking framed stream over a unix socket.
//!
//! This is the worker-side transport: buffered reads with a choice of
//! blocking or polling mode, eager buffered writes, and `SCM_RIGHTS`
//! file-descriptor passing. Received descriptors get `CLOEXEC` set before
//! they are handed out.

use crate::error::{Error, Result};
use crate::frame::{self, Frame};
use bytes::BytesMut;
use sendfd::{RecvWithFd, SendWithFd};
use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

const READ_CHUNK: usize = 4096;
const MAX_PASSED_FDS: usize = 4;

/// A framed, optionally fd-carrying stream over a blocking unix socket.
pub struct FrameStream {
    sock: UnixStream,
    inbuf: BytesMut,
    outbuf: BytesMut,
    rx_fds: VecDeque<OwnedFd>,
}

impl FrameStream {
    pub fn new(sock: UnixStream) -> FrameStream {
        FrameStream {
            sock,
            inbuf: BytesMut::with_capacity(READ_CHUNK),
            outbuf: BytesMut::new(),
            rx_fds: VecDeque::new(),
        }
    }

    /// Enqueue a frame on the output buffer. A frame carrying a file
    /// descriptor forces a flush so the descriptor rides its own bytes.
    pub fn compose(&mut self, frame: Frame) -> Result<()> {
        match frame.fd {
            None => {
                frame.encode(&mut self.outbuf);
                Ok(())
            }
            Some(ref fd) => {
                self.flush()?;
                self.sock.set_nonblocking(false)?;
                let mut buf = BytesMut::with_capacity(frame.wire_len());
                frame.encode(&mut buf);
                let raw = fd.as_raw_fd();
                let mut sent_fd = false;
                let mut off = 0;
                while off < buf.len() {
                    let res = if sent_fd {
                        self.sock.send_with_fd(&buf[off..], &[])
                    } else {
                        self.sock.send_with_fd(&buf[off..], &[raw])
                    };
                    match res {
                        Ok(n) => {
                            off += n;
                            if n > 0 {
                                sent_fd = true;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                Ok(())
            }
        }
    }

    /// Write out everything buffered. Writes always block; the polling
    /// mode of `recv` applies to reads only.
    pub fn flush(&mut self) -> Result<()> {
        if !self.outbuf.is_empty() {
            self.sock.set_nonblocking(false)?;
        }
        while !self.outbuf.is_empty() {
            match self.sock.send_with_fd(&self.outbuf, &[]) {
                Ok(0) => return Err(Error::Closed),
                Ok(n) => {
                    let _ = self.outbuf.split_to(n);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Compose and flush in one step.
    pub fn send(&mut self, frame: Frame) -> Result<()> {
        self.compose(frame)?;
        self.flush()
    }

    /// Receive one frame.
    ///
    /// With `wait` set this blocks until a full frame (or EOF) arrives;
    /// otherwise it returns `Ok(None)` when no complete frame is buffered
    /// and the socket has nothing more to offer right now.
    pub fn recv(&mut self, wait: bool) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.read_one()? {
                return Ok(Some(frame));
            }

            self.sock.set_nonblocking(!wait)?;
            let mut buf = [0u8; READ_CHUNK];
            let mut fds: [RawFd; MAX_PASSED_FDS] = [-1; MAX_PASSED_FDS];
            match self.sock.recv_with_fd(&mut buf, &mut fds) {
                Ok((0, _)) => return Err(Error::Closed),
                Ok((n, nfds)) => {
                    self.inbuf.extend_from_slice(&buf[..n]);
                    for &fd in &fds[..nfds] {
                        self.rx_fds.push_back(claim_fd(fd));
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !wait {
                        return Ok(None);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Non-destructively pull one complete frame from the input buffer.
    pub fn read_one(&mut self) -> Result<Option<Frame>> {
        match frame::decode_one(&mut self.inbuf)? {
            None => Ok(None),
            Some((mut frame, wants_fd)) => {
                if wants_fd {
                    frame.fd = Some(
                        self.rx_fds
                            .pop_front()
                            .ok_or_else(|| Error::Protocol("frame missing its fd".into()))?,
                    );
                }
                Ok(Some(frame))
            }
        }
    }
}

/// Take ownership of a received descriptor and set `CLOEXEC` on it.
fn claim_fd(fd: RawFd) -> OwnedFd {
    unsafe {
        libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        OwnedFd::from_raw_fd(fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::MsgType;
    use bytes::{Bytes, BytesMut};
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom, Write};

    #[test]
    fn roundtrip_without_fd() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut tx = FrameStream::new(a);
        let mut rx = FrameStream::new(b);

        let mut payload = BytesMut::new();
        frame::put_cstr(&mut payload, "/music/a.ogg");
        tx.send(Frame::new(MsgType::Add, payload.freeze())).unwrap();

        let got = rx.recv(true).unwrap().unwrap();
        assert_eq!(got.msg_type, MsgType::Add);
        assert!(got.fd.is_none());
    }

    #[test]
    fn poll_mode_returns_none_when_idle() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut rx = FrameStream::new(a);
        assert!(rx.recv(false).unwrap().is_none());
    }

    #[test]
    fn eof_reports_closed() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);
        let mut rx = FrameStream::new(a);
        assert!(matches!(rx.recv(true), Err(Error::Closed)));
    }

    #[test]
    fn passes_fd_with_cloexec() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut tx = FrameStream::new(a);
        let mut rx = FrameStream::new(b);

        let mut tmp = tempfile::tempfile().unwrap();
        tmp.write_all(b"pcm bytes").unwrap();
        tmp.seek(SeekFrom::Start(0)).unwrap();

        let frame = Frame::new(MsgType::Open, Bytes::new()).with_fd(tmp.into());
        tx.send(frame).unwrap();

        let got = rx.recv(true).unwrap().unwrap();
        let fd = got.fd.expect("fd should have been passed");

        let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);

        let mut file = File::from(fd);
        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "pcm bytes");
    }

    #[test]
    fn frames_stay_fifo() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut tx = FrameStream::new(a);
        let mut rx = FrameStream::new(b);

        for t in [MsgType::Stop, MsgType::Play] {
            tx.compose(Frame::empty(t)).unwrap();
        }
        tx.flush().unwrap();

        assert_eq!(rx.recv(true).unwrap().unwrap().msg_type, MsgType::Stop);
        assert_eq!(rx.recv(true).unwrap().unwrap().msg_type, MsgType::Play);
    }
}
