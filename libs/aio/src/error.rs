//! Socket errors.

use std::io;

use thiserror::Error;

/// Errors reported synchronously by the socket API.
///
/// I/O failures on an established socket never show up here; they are
/// delivered as a failed completion and a disconnection notification.
#[derive(Debug, Error)]
pub enum SocketError {
    /// Outbound connect failed or timed out.
    #[error("failed to connect to {host}:{port}: {source}")]
    ConnectFailed {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    /// `connect` was called on a socket that is already connected.
    #[error("socket is already connected")]
    AlreadyConnected,

    /// The socket is in a state that does not allow the operation.
    #[error("invalid socket state: {0}")]
    InvalidState(&'static str),

    /// The notifier cannot run on the current tokio runtime.
    #[error("unsupported runtime: {0}")]
    UnsupportedRuntime(&'static str),
}

impl SocketError {
    /// Whether this error came from the network rather than API misuse.
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, SocketError::ConnectFailed { .. })
    }
}
