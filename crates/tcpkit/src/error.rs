//! Error types.

use std::io;

use thiserror::Error;

use crate::config::ConfigError;

/// A specialized `Result` type for connection operations.
pub type TcpResult<T> = std::result::Result<T, ConnError>;

/// Errors returned to callers of [`Conn::async_write_packet`](crate::Conn::async_write_packet).
///
/// These are backpressure outcomes, local to one call. They never close the
/// connection on their own; the caller decides whether to retry, drop or log.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnError {
    /// The connection is closing or already closed.
    #[error("use of closed network connection")]
    ConnClosing,

    /// The outbound queue is full and the caller asked not to wait.
    #[error("write packet was blocking")]
    WriteBlocking,

    /// The outbound queue stayed full for the whole timeout.
    #[error("write packet timeout")]
    WriteTimeout,
}

/// Errors produced while reading one packet off a byte stream.
///
/// Every variant is terminal for the connection that produced it: the core
/// performs no partial-frame recovery.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The peer closed the stream on a frame boundary.
    #[error("connection closed by peer")]
    Closed,

    /// An underlying I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The frame announced or accumulated more bytes than allowed.
    #[error("Frame size ({size} bytes) exceeds maximum allowed ({max} bytes)")]
    FrameTooLarge {
        /// Size of the offending frame in bytes
        size: usize,
        /// Configured maximum in bytes
        max: usize,
    },

    /// The bytes on the wire do not form a valid frame.
    #[error("Malformed frame: {0}")]
    Malformed(String),
}

impl ProtocolError {
    /// Returns `true` if the peer simply went away.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Closed => true,
            Self::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Errors from the server's convenience entry points.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ServerError {
    /// Binding the listening socket failed.
    #[error("Failed to bind TCP listener: {0}")]
    Bind(#[source] io::Error),

    /// The configuration could not be loaded or is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
}
