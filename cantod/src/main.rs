//! canto daemon (cantod)
//!
//! Owns the playlist and play state, serves the control socket, and
//! supervises the decode worker.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cantod::config::Config;
use cantod::daemon::{Daemon, DaemonMsg, Exit};
use cantod::{control, persist, player};
use canto_common::paths;

/// canto music daemon - playlist orchestrator and control socket
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Control socket path (overrides CANTO_SOCKET and the config file)
    #[arg(short, long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

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
                format!("cantod={},canto_common={}", log_level, log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(args) {
        Ok(Exit::Shutdown) => ExitCode::SUCCESS,
        Ok(Exit::WorkerLost) => {
            error!("player worker lost, giving up");
            ExitCode::from(2)
        }
        Err(e) => {
            error!("fatal: {:#}", e);
            ExitCode::from(1)
        }
    }
}

#[tokio::main]
async fn run(args: Args) -> anyhow::Result<Exit> {
    // A dead client must never kill the daemon mid-write.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    info!("canto daemon starting...");

    let config = Config::load(args.config.as_deref())?;
    let config = Arc::new(Mutex::new(config));

    let socket = {
        let c = config.lock().unwrap();
        paths::socket_path(args.socket.clone(), c.socket.clone())
    };

    std::fs::create_dir_all(paths::runtime_dir())?;
    if let Some(parent) = socket.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = control::bind_socket(&socket)?;

    let (daemon_tx, daemon_rx) = mpsc::channel(256);

    let device = config.lock().unwrap().audio_device.clone();
    let (player_tx, link) = player::spawn_link(daemon_tx.clone(), device, args.verbose)?;

    let mut daemon = Daemon::new(daemon_rx, player_tx);

    let snapshot = paths::snapshot_path();
    if config.lock().unwrap().persist {
        match persist::load(&snapshot) {
            Ok(Some((songs, cursor))) => daemon.restore(songs, cursor),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "cannot read playlist snapshot"),
        }
    }

    let accept = tokio::spawn(control::accept_loop(listener, daemon_tx.clone()));

    spawn_signal_task(daemon_tx, config.clone(), args.config.clone());

    let exit = daemon.run().await;

    // Shutdown: stop accepting, snapshot, let the writers drain briefly,
    // then remove the socket.
    accept.abort();
    if config.lock().unwrap().persist {
        let (songs, cursor) = daemon.snapshot();
        if let Err(e) = persist::save(&snapshot, &songs, cursor) {
            warn!(error = %e, "cannot write playlist snapshot");
        }
    }
    let _ = tokio::time::timeout(std::time::Duration::from_secs(2), link).await;
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let _ = std::fs::remove_file(&socket);

    info!("bye");
    Ok(exit)
}

/// SIGTERM/SIGINT request a graceful shutdown; SIGHUP reloads the
/// configuration file.
fn spawn_signal_task(
    daemon: mpsc::Sender<DaemonMsg>,
    config: Arc<Mutex<Config>>,
    config_path: Option<PathBuf>,
) {
    tokio::spawn(async move {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                return;
            }
        };
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot install SIGINT handler");
                return;
            }
        };
        let mut hup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cannot install SIGHUP handler");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = term.recv() => {
                    info!("SIGTERM received");
                    let _ = daemon.send(DaemonMsg::Shutdown).await;
                }
                _ = int.recv() => {
                    info!("SIGINT received");
                    let _ = daemon.send(DaemonMsg::Shutdown).await;
                }
                _ = hup.recv() => {
                    info!("SIGHUP received, reloading configuration");
                    let mut c = config.lock().unwrap();
                    let reloaded = Config::reload(config_path.as_deref(), &c);
                    *c = reloaded;
                }
            }
        }
    });
}
