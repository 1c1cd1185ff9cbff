//! Common error types for canto

use thiserror::Error;

/// Common result type for canto operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors shared between the daemon and the player worker
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame, bad payload size, or unknown message type.
    /// The offending connection must be closed.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The peer closed the stream.
    #[error("connection closed")]
    Closed,

    #[error("configuration error: {0}")]
    Config(String),

    /// Fatal audio-device failure in the player worker.
    #[error("audio device error: {0}")]
    Audio(String),
}
