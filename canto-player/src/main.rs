//! canto player worker (canto-player)
//!
//! Spawned by cantod with the privileged socketpair on stdin. Serves one
//! track per `Open` message: sniffs the codec, decodes via symphonia,
//! writes PCM to the audio device, and reports position and lifecycle
//! events back up the link. Knows nothing about playlists, and never
//! opens a filesystem path: tracks arrive as already-open descriptors.

use clap::Parser;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use canto_common::error::Error;
use canto_common::stream::FrameStream;

mod decode;
mod link;
mod output;
mod sniff;

use decode::Outcome;
use link::PlayerLink;
use output::AudioOutput;

/// canto decode worker - internal, spawned by cantod
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Audio output device name (default device if omitted)
    #[arg(long, value_name = "NAME")]
    device: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let log_level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("canto_player={},canto_common={}", log_level, log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let sock = match adopt_command_socket() {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "no command socket on stdin");
            return ExitCode::FAILURE;
        }
    };

    info!("player worker ready");
    match serve(sock, args.device) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// The daemon hands us the socketpair as stdin; duplicate it away from
/// fd 0 and mark it close-on-exec.
fn adopt_command_socket() -> io::Result<UnixStream> {
    let fd = unsafe { libc::dup(libc::STDIN_FILENO) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    unsafe {
        libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
    }
    Ok(UnixStream::from(unsafe { OwnedFd::from_raw_fd(fd) }))
}

/// Serve tracks until the daemon goes away.
fn serve(sock: UnixStream, device: Option<String>) -> anyhow::Result<()> {
    let mut link = PlayerLink::new(FrameStream::new(sock));
    let mut output = AudioOutput::new(device);

    loop {
        let track = match link.wait_for_track() {
            Ok(t) => t,
            Err(Error::Closed) => {
                info!("daemon closed the link, exiting");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let outcome = match decode::play_track(track, &mut link, &mut output) {
            Ok(o) => o,
            Err(Error::Closed) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        match outcome {
            Outcome::Finished => link.send_done()?,
            Outcome::Stopped => {}
            Outcome::Error(msg) => {
                warn!(error = %msg, "track failed");
                link.send_error(&msg)?;
            }
        }
    }
}
