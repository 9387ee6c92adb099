//! Error types for the Flock real-time link.

use std::sync::Arc;

use thiserror::Error;

use crate::error_codes::RejectCode;

/// Errors that can occur when using the real-time link.
///
/// `LinkError` is `Clone` because a single in-flight connection attempt is
/// shared between every caller of [`ConnectionManager::connect`](crate::ConnectionManager::connect),
/// and each of them receives the same outcome.
#[derive(Debug, Clone, Error)]
pub enum LinkError {
    /// Failed to send a frame through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a frame from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed unexpectedly.
    #[error("transport connection closed")]
    TransportClosed,

    /// The transport could not be established.
    #[error("connection failed: {0}")]
    ConnectFailed(String),

    /// The connection attempt budget was exhausted.
    #[error("connection failed after {attempts} attempt(s)")]
    ConnectionExhausted {
        /// Number of attempts that were made.
        attempts: u32,
    },

    /// The server rejected the `verify_auth` handshake.
    #[error("authentication rejected: {reason}")]
    AuthRejected {
        /// Human-readable reason supplied by the server.
        reason: String,
        /// Structured rejection code, if provided by the server.
        code: Option<RejectCode>,
    },

    /// Failed to serialize or deserialize a frame or payload.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Attempted an operation that requires an active connection, but the link is not connected.
    #[error("not connected to server")]
    NotConnected,

    /// The server rejected a chat message.
    #[error("message rejected: {reason}")]
    MessageRejected {
        /// Human-readable reason supplied by the server.
        reason: String,
        /// Structured rejection code, if provided by the server.
        code: Option<RejectCode>,
    },

    /// The connection attempt was abandoned because `disconnect()` was called.
    #[error("connection attempt cancelled")]
    Cancelled,

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl LinkError {
    /// Returns `true` for failures that count against the reconnect budget
    /// instead of ending the session outright.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::AuthRejected { .. } | Self::Cancelled)
    }
}

/// A specialized [`Result`] type for link operations.
pub type Result<T> = std::result::Result<T, LinkError>;
