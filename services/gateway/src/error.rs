//! Gateway errors.

use std::io;

use portgate_aio::SocketError;
use thiserror::Error;

/// Errors raised while bringing the gateway up.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The I/O notifier could not be created.
    #[error(transparent)]
    Notifier(#[from] SocketError),
}
