//! Daemon configuration.
//!
//! Loaded from `~/.config/canto/config.toml` (or an explicit `--config`
//! path). A missing file is never fatal: every key has a default, and
//! CLI flags and environment variables take precedence over the file.

use canto_common::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Control socket path; overridden by `--socket` and `CANTO_SOCKET`.
    pub socket: Option<PathBuf>,

    /// Audio output device name for the worker (default device if unset).
    pub audio_device: Option<String>,

    /// Save and restore the playlist across restarts.
    pub persist: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            socket: None,
            audio_device: None,
            persist: true,
        }
    }
}

impl Config {
    /// Load the configuration. An explicit path must exist and parse; the
    /// default location degrades to defaults when absent.
    pub fn load(explicit: Option<&Path>) -> Result<Config> {
        let (path, required) = match explicit {
            Some(p) => (p.to_path_buf(), true),
            None => match default_path() {
                Some(p) => (p, false),
                None => return Ok(Config::default()),
            },
        };

        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Config::default());
            }
            Err(e) => {
                return Err(Error::Config(format!(
                    "cannot read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let config: Config = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Re-read the configuration for SIGHUP. Parse failures keep the
    /// running configuration instead of propagating.
    pub fn reload(explicit: Option<&Path>, current: &Config) -> Config {
        match Config::load(explicit) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "config reload failed, keeping current settings");
                current.clone()
            }
        }
    }
}

fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("canto").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_when_unconfigured() {
        let c = Config::default();
        assert!(c.socket.is_none());
        assert!(c.audio_device.is_none());
        assert!(c.persist);
    }

    #[test]
    fn parses_full_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "socket = \"/tmp/c.sock\"").unwrap();
        writeln!(f, "audio_device = \"hw:1\"").unwrap();
        writeln!(f, "persist = false").unwrap();

        let c = Config::load(Some(&path)).unwrap();
        assert_eq!(c.socket, Some(PathBuf::from("/tmp/c.sock")));
        assert_eq!(c.audio_device.as_deref(), Some("hw:1"));
        assert!(!c.persist);
    }

    #[test]
    fn explicit_path_must_exist() {
        assert!(Config::load(Some(Path::new("/nonexistent/canto.toml"))).is_err());
    }

    #[test]
    fn unknown_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "volume = 11\n").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn reload_keeps_current_on_error() {
        let current = Config {
            socket: Some(PathBuf::from("/tmp/keep.sock")),
            audio_device: None,
            persist: true,
        };
        let reloaded = Config::reload(Some(Path::new("/nonexistent/canto.toml")), &current);
        assert_eq!(reloaded.socket, current.socket);
    }
}
