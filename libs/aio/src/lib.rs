//! Callback-driven asynchronous TCP sockets.
//!
//! This library provides:
//! - An I/O notifier seam that turns socket readiness into one-shot callbacks
//!   delivered on runtime worker threads
//! - A reactor-backed notifier built on the tokio multi-thread runtime
//! - An async socket with queued reads/writes, at most one operation in flight
//!   per direction, and exactly-once disconnection notification
//!
//! ## Usage
//!
//! ```ignore
//! use portgate_aio::{AsyncSocket, ReactorNotifier, READ_CHUNK_SIZE};
//!
//! let notifier = Arc::new(ReactorNotifier::current()?);
//! let socket = AsyncSocket::new(notifier);
//! socket.connect("127.0.0.1", 6379, Duration::from_secs(1))?;
//! socket.set_disconnection_handler(|reason| println!("closed: {reason}"));
//! socket.async_read(READ_CHUNK_SIZE, |result| println!("{} bytes", result.buffer.len()));
//! ```

mod error;
mod notifier;
mod socket;

pub use error::SocketError;
pub use notifier::{
    blocking_section, next_socket_id, Interest, IoCallback, IoNotifier, ReactorNotifier, SocketId,
};
pub use socket::{
    AsyncSocket, CloseOutcome, CloseReason, InFlight, ReadResult, WriteResult, READ_CHUNK_SIZE,
};
