//! Error types for Lumen.

use thiserror::Error;

/// Why a single command did not produce a result.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The server replied with an error message.
    ///
    /// Application and permission errors land here and are never retried.
    #[error("rejected by server: {0}")]
    Rejected(String),

    /// The connection went away while the command was outstanding and the
    /// command could not be replayed.
    #[error("connection lost")]
    ConnectionLost,

    /// The connection was disabled; every outstanding command is dropped.
    #[error("connection disabled")]
    Disabled,

    /// The reply payload did not match the command's result shape.
    #[error("invalid reply: {0}")]
    InvalidReply(String),
}

/// Why a connection attempt or a live connection failed.
///
/// The `Display` form is what a UI shows as `last_error`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// No candidate endpoint opened and delivered `init` in time.
    #[error("timed out connecting to the controller")]
    ConnectTimeout,

    /// A sent command got no reply in time.
    #[error("timed out waiting for a reply")]
    ReplyTimeout,

    /// The socket closed or errored.
    #[error("connection closed: {0}")]
    SocketClosed(String),

    /// The server forced the connection to fail.
    #[error("controller error: {0}")]
    ServerError(String),

    /// The server speaks a protocol older than this client supports.
    #[error(
        "the controller runs protocol version {announced}, but at least version {minimum} is required; please update the controller"
    )]
    UnsupportedVersion {
        /// Version the server announced.
        announced: u32,
        /// Minimum version this client requires.
        minimum: u32,
    },

    /// The server violated the protocol (malformed or out-of-order message).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No endpoint was configured or it could not be turned into a URL.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Errors from loading or saving persisted state.
#[derive(Debug, Error)]
pub enum PersistError {
    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The stored document was not valid.
    #[error("invalid persisted state: {0}")]
    Format(#[from] serde_json::Error),
}

/// Top-level Lumen errors.
#[derive(Debug, Error)]
pub enum LumenError {
    /// Command error.
    #[error("command error: {0}")]
    Command(#[from] CommandError),

    /// Connection error.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Persistence error.
    #[error("persistence error: {0}")]
    Persist(#[from] PersistError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
