//! Global error types for the socket.io client.
//!
//! All failure categories of the handshake, the persistent stream and the
//! acknowledgement path are unified into a single `SioError` enum. The enum
//! is `Clone` because one failure is routinely fanned out to every pending
//! acknowledgement and every endpoint sharing a connection.

use thiserror::Error;

/// Convenience type alias for Results using SioError.
pub type SioResult<T> = Result<T, SioError>;

/// Unified error type for the socket.io client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SioError {
    // -- Handshake errors --
    /// The handshake request failed at the transport level.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The handshake succeeded but the server offered no persistent transport.
    #[error("unsupported transport: server offered [{0}]")]
    UnsupportedTransport(String),

    // -- Stream errors --
    /// The persistent stream dropped or could not be (re)opened.
    #[error("stream error: {0}")]
    Stream(String),

    /// A frame was written while no stream was live.
    #[error("not connected")]
    NotConnected,

    // -- Acknowledgement errors --
    /// The stream carrying a pending acknowledgement was torn down.
    #[error("acknowledgement {0} abandoned")]
    AckAbandoned(u64),

    /// A pending acknowledgement was not resolved in time.
    #[error("acknowledgement {0} timed out")]
    AckTimeout(u64),

    // -- Session errors --
    /// The pending connect was cancelled before it completed.
    #[error("connect cancelled")]
    Cancelled,

    /// The endpoint is already registered on this connection.
    #[error("endpoint already joined: {0}")]
    DuplicateEndpoint(String),

    /// A handshake body or frame did not follow the wire format.
    #[error("protocol error: {0}")]
    Protocol(String),

    // -- Configuration errors --
    /// Failed to load, parse or validate configuration.
    #[error("configuration error: {0}")]
    Config(String),

    // -- File/IO errors --
    /// File system operation failed.
    #[error("io error: {0}")]
    Io(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // -- Generic --
    /// An unexpected internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SioError {
    /// Whether the reconnect loop should try again after this error.
    ///
    /// Only stream-level failures are retried; anything else means the
    /// session itself is unusable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SioError::Stream(_) | SioError::NotConnected)
    }
}

impl From<std::io::Error> for SioError {
    fn from(e: std::io::Error) -> Self {
        SioError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for SioError {
    fn from(e: serde_json::Error) -> Self {
        SioError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for SioError {
    fn from(e: toml::de::Error) -> Self {
        SioError::Config(e.to_string())
    }
}

impl From<anyhow::Error> for SioError {
    fn from(e: anyhow::Error) -> Self {
        SioError::Internal(format!("{e:#}"))
    }
}
