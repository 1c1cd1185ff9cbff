//! Runtime directory and socket path resolution.
//!
//! The daemon keeps its control socket and playlist snapshot in a
//! per-user runtime directory: `$XDG_RUNTIME_DIR/canto`, falling back to
//! `$HOME/.canto` and finally a uid-suffixed directory under the system
//! temp dir.

use std::env;
use std::path::PathBuf;

/// Environment variable overriding the control socket location.
pub const SOCKET_ENV: &str = "CANTO_SOCKET";

/// Per-user runtime directory for the socket and snapshot.
pub fn runtime_dir() -> PathBuf {
    if let Some(dir) = env::var_os("XDG_RUNTIME_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir).join("canto");
        }
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".canto");
    }
    let uid = unsafe { libc::getuid() };
    env::temp_dir().join(format!("canto-{}", uid))
}

/// Default control socket path inside the runtime directory.
pub fn default_socket_path() -> PathBuf {
    runtime_dir().join("ctl.sock")
}

/// Resolve the control socket path: CLI flag, then `CANTO_SOCKET`, then
/// the configuration file, then the default.
pub fn socket_path(cli: Option<PathBuf>, config: Option<PathBuf>) -> PathBuf {
    if let Some(path) = cli {
        return path;
    }
    if let Some(path) = env::var_os(SOCKET_ENV) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }
    if let Some(path) = config {
        return path;
    }
    default_socket_path()
}

/// Playlist snapshot location inside the runtime directory.
pub fn snapshot_path() -> PathBuf {
    runtime_dir().join("queue")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn runtime_dir_prefers_xdg() {
        env::set_var("XDG_RUNTIME_DIR", "/run/user/1000");
        assert_eq!(runtime_dir(), PathBuf::from("/run/user/1000/canto"));
        env::remove_var("XDG_RUNTIME_DIR");
    }

    #[test]
    #[serial]
    fn socket_path_precedence() {
        env::remove_var(SOCKET_ENV);

        let cli = Some(PathBuf::from("/tmp/cli.sock"));
        let cfg = Some(PathBuf::from("/tmp/cfg.sock"));
        assert_eq!(
            socket_path(cli.clone(), cfg.clone()),
            PathBuf::from("/tmp/cli.sock")
        );

        env::set_var(SOCKET_ENV, "/tmp/env.sock");
        assert_eq!(
            socket_path(None, cfg.clone()),
            PathBuf::from("/tmp/env.sock")
        );
        env::remove_var(SOCKET_ENV);

        assert_eq!(socket_path(None, cfg), PathBuf::from("/tmp/cfg.sock"));
    }
}
