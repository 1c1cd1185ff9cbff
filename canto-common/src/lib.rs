//! # canto common library
//!
//! Shared code for the canto daemon and its player worker:
//! - the framed IPC substrate (wire format, blocking stream adapter)
//! - typed message payloads (modes, seek, status, monitor events)
//! - runtime directory and socket path resolution

pub mod error;
pub mod frame;
pub mod paths;
pub mod proto;
pub mod stream;

pub use error::{Error, Result};
