//! Error types for the sort server.
//!
//! Errors are split by blast radius: a `FormatError` or `ConnectionError`
//! only ever ends one connection, while a `ServerError` is reported to
//! whoever drives the server lifecycle.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// The bytes of a message body do not describe a list under the negotiated
/// framing protocol.
#[derive(Debug, Error)]
pub enum FormatError {
    /// Body length is not a multiple of the fixed element width.
    #[error("body of {len} bytes is not a multiple of the {width}-byte element width")]
    Misaligned { len: usize, width: usize },

    /// Length prefix announces a body larger than the configured limit.
    #[error("message body of {length} bytes exceeds the {max}-byte limit")]
    TooLarge { length: usize, max: usize },

    /// The list could not be serialised.
    #[error("failed to encode list: {0}")]
    Encode(String),

    /// The body is not a valid encoded list.
    #[error("failed to decode list: {0}")]
    Decode(String),
}

/// Failure of a single client connection. Never affects sibling connections.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Socket read or write failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer sent a malformed message.
    #[error("malformed message: {0}")]
    Format(#[from] FormatError),

    /// The peer closed the connection in the middle of a message.
    #[error("peer closed the connection with {missing} bytes of a message outstanding")]
    UnexpectedEof { missing: usize },
}

/// Failure surfaced by the server lifecycle (`run` / `close`).
#[derive(Debug, Error)]
pub enum ServerError {
    /// Listener or thread setup failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// `run` was called on a server that has already been closed.
    #[error("server is closed and cannot be restarted")]
    AlreadyClosed,

    /// `run` was called while the accept loop is already running.
    #[error("server is already running")]
    AlreadyRunning,

    /// A bounded shutdown wait elapsed; resources may have leaked.
    #[error("{what} did not shut down within {timeout:?}")]
    ShutdownTimeout {
        what: &'static str,
        timeout: Duration,
    },

    /// The selector wait call failed for a reason other than a wakeup.
    #[error("selector failed: {0}")]
    SelectorFatal(io::Error),

    /// Work was submitted to a pool that no longer accepts it.
    #[error("worker pool is shut down")]
    PoolClosed,
}
