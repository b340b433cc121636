//! Asynchronous socket core.
//!
//! An [`AsyncSocket`] wraps one TCP stream and exposes queued, callback-driven
//! reads and writes on top of an [`IoNotifier`]:
//!
//! - Requests are queued FIFO per direction; only the front request of each
//!   direction is ever in flight.
//! - Completion callbacks run outside the socket lock, so they may issue new
//!   requests on the same socket.
//! - A receive or send failure closes the socket; it is reported as a failed
//!   completion followed by the disconnection notification.
//! - The disconnection handler runs exactly once per socket no matter how
//!   many paths try to close it.
//!
//! ## Close semantics
//!
//! - Graceful (`disconnect(false)`): stop accepting requests, drop queued
//!   reads, keep draining queued writes, then release.
//! - Forced (`disconnect(true)`): untrack immediately and drop everything
//!   queued; release as soon as the in-flight operation (if any) comes back.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::mem;
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use socket2::SockRef;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::error::SocketError;
use crate::notifier::{blocking_section, next_socket_id, IoNotifier, SocketId};

/// Bytes requested per receive attempt.
pub const READ_CHUNK_SIZE: usize = 16384;

/// Why a socket was closed. The first trigger wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `disconnect` was called.
    Requested,
    /// The peer shut down its side (zero-length receive).
    PeerClosed,
    /// A receive failed.
    ReadFailed,
    /// A send failed.
    WriteFailed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::Requested => "requested",
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::ReadFailed => "read_failed",
            CloseReason::WriteFailed => "write_failed",
        };
        f.write_str(s)
    }
}

/// Result of a `disconnect` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Released synchronously; the handler has already run.
    Closed,
    /// Release happens when in-flight work comes back.
    Deferred,
    /// Already closing, already closed, or never opened.
    Ignored,
}

/// Completion of a read request.
#[derive(Debug, Clone)]
pub struct ReadResult {
    pub success: bool,
    pub buffer: Bytes,
}

impl ReadResult {
    fn failed() -> Self {
        Self {
            success: false,
            buffer: Bytes::new(),
        }
    }
}

/// Completion of a write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    pub success: bool,
    /// Bytes handed to the kernel for this request.
    pub size: usize,
}

/// Snapshot of a socket's request bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InFlight {
    pub reading: bool,
    pub writing: bool,
    pub queued_reads: usize,
    pub queued_writes: usize,
}

type ReadCallback = Box<dyn FnOnce(ReadResult) + Send + 'static>;
type WriteCallback = Box<dyn FnOnce(WriteResult) + Send + 'static>;
type DisconnectHandler = Box<dyn FnOnce(CloseReason) + Send + 'static>;

struct ReadRequest {
    size: usize,
    callback: ReadCallback,
}

struct WriteRequest {
    buffer: Bytes,
    written: usize,
    callback: WriteCallback,
}

#[derive(Default)]
struct SocketState {
    stream: Option<Arc<TcpStream>>,
    /// A stream was attached at some point.
    opened: bool,
    connected: bool,
    shutting_down: bool,
    recv_in_flight: bool,
    send_in_flight: bool,
    released: bool,
    notified: bool,
    close_reason: Option<CloseReason>,
    read_queue: VecDeque<ReadRequest>,
    write_queue: VecDeque<WriteRequest>,
    on_disconnect: Option<DisconnectHandler>,
}

/// Work collected under the lock and finished after releasing it.
struct Teardown {
    id: SocketId,
    reason: CloseReason,
    handler: Option<DisconnectHandler>,
    reads: VecDeque<ReadRequest>,
    writes: VecDeque<WriteRequest>,
}

impl Teardown {
    fn notify(self) {
        debug!(
            socket_id = self.id,
            reason = %self.reason,
            dropped_reads = self.reads.len(),
            dropped_writes = self.writes.len(),
            "Socket released"
        );
        drop(self.reads);
        drop(self.writes);
        if let Some(handler) = self.handler {
            handler(self.reason);
        }
    }
}

struct Shared {
    id: SocketId,
    notifier: Arc<dyn IoNotifier>,
    state: Mutex<SocketState>,
}

/// Callback-driven TCP socket.
pub struct AsyncSocket {
    shared: Arc<Shared>,
}

impl AsyncSocket {
    /// Create an unconnected socket.
    pub fn new(notifier: Arc<dyn IoNotifier>) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: next_socket_id(),
                notifier,
                state: Mutex::new(SocketState::default()),
            }),
        }
    }

    /// Wrap an accepted stream. The socket starts connected and tracked.
    pub fn from_stream(notifier: Arc<dyn IoNotifier>, stream: TcpStream) -> Self {
        let _ = stream.set_nodelay(true);
        let socket = Self::new(notifier);
        {
            let mut state = socket.shared.state.lock();
            socket.shared.install(&mut state, stream);
        }
        socket
    }

    /// Identity of this socket.
    pub fn id(&self) -> SocketId {
        self.shared.id
    }

    /// Whether the socket accepts I/O.
    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().connected
    }

    /// Remote address, while the stream is held.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        let state = self.shared.state.lock();
        state.stream.as_ref().and_then(|s| s.peer_addr().ok())
    }

    /// Snapshot of queue and in-flight state.
    pub fn in_flight(&self) -> InFlight {
        let state = self.shared.state.lock();
        InFlight {
            reading: state.recv_in_flight,
            writing: state.send_in_flight,
            queued_reads: state.read_queue.len(),
            queued_writes: state.write_queue.len(),
        }
    }

    /// Connect to `host:port`, blocking for at most `timeout` across all resolved addresses.
    pub fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<(), SocketError> {
        self.shared.state.lock().check_connectable()?;

        let stream = blocking_section(|| connect_with_timeout(host, port, timeout))
            .and_then(|stream| {
                stream.set_nonblocking(true)?;
                let _ = stream.set_nodelay(true);
                let _enter = self.shared.notifier.runtime().enter();
                TcpStream::from_std(stream)
            })
            .map_err(|source| SocketError::ConnectFailed {
                host: host.to_string(),
                port,
                source,
            })?;

        let mut state = self.shared.state.lock();
        state.check_connectable()?;
        self.shared.install(&mut state, stream);
        debug!(socket_id = self.id(), host, port, "Socket connected");
        Ok(())
    }

    /// Register the handler that runs once when the socket is released.
    ///
    /// If the socket was released before any handler was registered, the
    /// handler runs immediately.
    pub fn set_disconnection_handler<F>(&self, handler: F)
    where
        F: FnOnce(CloseReason) + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if !state.released {
            state.on_disconnect = Some(Box::new(handler));
            return;
        }
        if state.notified {
            return;
        }
        state.notified = true;
        let reason = state.close_reason.unwrap_or(CloseReason::Requested);
        drop(state);
        handler(reason);
    }

    /// Queue a read of up to `max_size` bytes.
    ///
    /// Silently ignored once the socket is closing or closed.
    pub fn async_read<F>(&self, max_size: usize, callback: F)
    where
        F: FnOnce(ReadResult) + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if !state.connected || state.shutting_down {
            return;
        }

        state.read_queue.push_back(ReadRequest {
            size: max_size.max(1),
            callback: Box::new(callback),
        });

        if !state.recv_in_flight {
            self.shared.arm_read(&mut state);
        }
    }

    /// Queue a write of `buffer`.
    ///
    /// The completion fires once the whole buffer has been sent. Silently
    /// ignored once the socket is closing or closed.
    pub fn async_write<F>(&self, buffer: Bytes, callback: F)
    where
        F: FnOnce(WriteResult) + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        if !state.connected || state.shutting_down {
            return;
        }

        state.write_queue.push_back(WriteRequest {
            buffer,
            written: 0,
            callback: Box::new(callback),
        });

        if !state.send_in_flight {
            self.shared.arm_write(&mut state);
        }
    }

    /// Close the socket, gracefully or forcibly.
    pub fn disconnect(&self, force: bool) -> CloseOutcome {
        let (outcome, teardown, discarded) = {
            let mut state = self.shared.state.lock();
            if !state.opened || state.released {
                return CloseOutcome::Ignored;
            }

            let discarded = if force {
                if state.shutting_down && !state.connected {
                    return CloseOutcome::Ignored;
                }
                self.shared.begin_close(&mut state, CloseReason::Requested);
                (
                    mem::take(&mut state.read_queue),
                    mem::take(&mut state.write_queue),
                )
            } else {
                if !state.connected || state.shutting_down {
                    return CloseOutcome::Ignored;
                }
                state.shutting_down = true;
                state.close_reason.get_or_insert(CloseReason::Requested);

                let keep = usize::from(state.recv_in_flight);
                let queued = state.read_queue.len();
                let reads = state.read_queue.split_off(keep.min(queued));
                if state.write_queue.is_empty() {
                    self.shared.begin_close(&mut state, CloseReason::Requested);
                }
                (reads, VecDeque::new())
            };

            let teardown = self.shared.release_if_idle(&mut state);
            let outcome = if teardown.is_some() {
                CloseOutcome::Closed
            } else {
                CloseOutcome::Deferred
            };
            (outcome, teardown, discarded)
        };

        trace!(socket_id = self.id(), force, ?outcome, "Disconnect requested");
        drop(discarded);
        if let Some(teardown) = teardown {
            teardown.notify();
        }
        outcome
    }
}

impl fmt::Debug for AsyncSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncSocket")
            .field("id", &self.shared.id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Drop for AsyncSocket {
    fn drop(&mut self) {
        self.disconnect(true);
        self.shared.notifier.wait_for_removal(self.shared.id);
    }
}

impl SocketState {
    fn check_connectable(&self) -> Result<(), SocketError> {
        if self.connected {
            Err(SocketError::AlreadyConnected)
        } else if self.opened {
            Err(SocketError::InvalidState("socket has been closed"))
        } else {
            Ok(())
        }
    }
}

impl Shared {
    fn install(&self, state: &mut SocketState, stream: TcpStream) {
        let stream = Arc::new(stream);
        self.notifier.track(self.id, Arc::downgrade(&stream));
        state.stream = Some(stream);
        state.opened = true;
        state.connected = true;
    }

    fn arm_read(self: &Arc<Self>, state: &mut SocketState) {
        state.recv_in_flight = true;
        let weak = Arc::downgrade(self);
        self.notifier.set_readable_callback(
            self.id,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.on_readable();
                }
            }),
        );
    }

    fn arm_write(self: &Arc<Self>, state: &mut SocketState) {
        state.send_in_flight = true;
        let weak = Arc::downgrade(self);
        self.notifier.set_writable_callback(
            self.id,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.on_writable();
                }
            }),
        );
    }

    /// Stop I/O. Release waits for in-flight operations to come back.
    fn begin_close(&self, state: &mut SocketState, reason: CloseReason) {
        state.close_reason.get_or_insert(reason);
        state.shutting_down = true;
        if state.connected {
            state.connected = false;
            self.notifier.untrack(self.id);
        }
    }

    /// Graceful close completes once the write queue is empty.
    fn finish_graceful(&self, state: &mut SocketState) {
        if state.connected && state.write_queue.is_empty() {
            self.begin_close(state, CloseReason::Requested);
        }
    }

    fn release_if_idle(&self, state: &mut SocketState) -> Option<Teardown> {
        if !state.opened
            || state.connected
            || state.released
            || state.recv_in_flight
            || state.send_in_flight
        {
            return None;
        }

        state.released = true;
        if let Some(stream) = state.stream.take() {
            // Reaches the peer even while a notifier task still holds the stream.
            let _ = SockRef::from(stream.as_ref()).shutdown(Shutdown::Both);
        }

        let handler = state.on_disconnect.take();
        state.notified = handler.is_some();

        Some(Teardown {
            id: self.id,
            reason: state.close_reason.unwrap_or(CloseReason::Requested),
            handler,
            reads: mem::take(&mut state.read_queue),
            writes: mem::take(&mut state.write_queue),
        })
    }

    fn on_readable(self: &Arc<Self>) {
        let (completion, teardown) = {
            let mut state = self.state.lock();
            state.recv_in_flight = false;
            let completion = if state.connected {
                self.read_front(&mut state)
            } else {
                None
            };
            (completion, self.release_if_idle(&mut state))
        };

        if let Some((callback, result)) = completion {
            callback(result);
        }
        if let Some(teardown) = teardown {
            teardown.notify();
        }
    }

    fn read_front(self: &Arc<Self>, state: &mut SocketState) -> Option<(ReadCallback, ReadResult)> {
        let stream = state.stream.clone()?;
        let size = state.read_queue.front()?.size;

        let mut buffer = BytesMut::zeroed(size);
        match stream.try_read(&mut buffer) {
            Err(e) if is_transient(&e) => {
                self.arm_read(state);
                None
            }
            Ok(0) => {
                debug!(socket_id = self.id, "Peer closed connection");
                self.fail_read(state, CloseReason::PeerClosed)
            }
            Err(e) => {
                debug!(socket_id = self.id, error = %e, "Receive failed");
                self.fail_read(state, CloseReason::ReadFailed)
            }
            Ok(n) => {
                buffer.truncate(n);
                let request = state.read_queue.pop_front()?;
                if state.shutting_down {
                    state.read_queue.clear();
                    self.finish_graceful(state);
                } else if !state.read_queue.is_empty() {
                    self.arm_read(state);
                }
                Some((
                    request.callback,
                    ReadResult {
                        success: true,
                        buffer: buffer.freeze(),
                    },
                ))
            }
        }
    }

    fn fail_read(
        &self,
        state: &mut SocketState,
        reason: CloseReason,
    ) -> Option<(ReadCallback, ReadResult)> {
        let request = state.read_queue.pop_front();
        self.begin_close(state, reason);
        request.map(|r| (r.callback, ReadResult::failed()))
    }

    fn on_writable(self: &Arc<Self>) {
        let (completion, teardown) = {
            let mut state = self.state.lock();
            state.send_in_flight = false;
            let completion = if state.connected {
                self.write_front(&mut state)
            } else {
                None
            };
            (completion, self.release_if_idle(&mut state))
        };

        if let Some((callback, result)) = completion {
            callback(result);
        }
        if let Some(teardown) = teardown {
            teardown.notify();
        }
    }

    fn write_front(
        self: &Arc<Self>,
        state: &mut SocketState,
    ) -> Option<(WriteCallback, WriteResult)> {
        let stream = state.stream.clone()?;
        let sent = {
            let request = state.write_queue.front()?;
            let remaining = &request.buffer[request.written..];
            if remaining.is_empty() {
                Ok(0)
            } else {
                match stream.try_write(remaining) {
                    Ok(0) => Err(io::Error::from(io::ErrorKind::WriteZero)),
                    other => other,
                }
            }
        };

        match sent {
            Err(e) if is_transient(&e) => {
                self.arm_write(state);
                None
            }
            Err(e) => {
                debug!(socket_id = self.id, error = %e, "Send failed");
                let request = state.write_queue.pop_front();
                self.begin_close(state, CloseReason::WriteFailed);
                request.map(|r| {
                    (
                        r.callback,
                        WriteResult {
                            success: false,
                            size: r.written,
                        },
                    )
                })
            }
            Ok(n) => {
                let flushed = {
                    let request = state.write_queue.front_mut()?;
                    request.written += n;
                    request.written >= request.buffer.len()
                };
                if !flushed {
                    // Short send: keep going with the rest of this buffer.
                    self.arm_write(state);
                    return None;
                }

                let request = state.write_queue.pop_front()?;
                if !state.write_queue.is_empty() {
                    self.arm_write(state);
                } else if state.shutting_down {
                    self.finish_graceful(state);
                }
                Some((
                    request.callback,
                    WriteResult {
                        success: true,
                        size: request.written,
                    },
                ))
            }
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn connect_with_timeout(
    host: &str,
    port: u16,
    timeout: Duration,
) -> io::Result<std::net::TcpStream> {
    connect_any((host, port).to_socket_addrs()?, timeout)
}

/// Try each address in turn until one connects. `timeout` bounds the whole
/// attempt, not each address.
fn connect_any<I>(addrs: I, timeout: Duration) -> io::Result<std::net::TcpStream>
where
    I: IntoIterator<Item = SocketAddr>,
{
    let deadline = Instant::now() + timeout;
    let mut last_error = None;
    for addr in addrs {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            last_error = Some(io::Error::new(
                io::ErrorKind::TimedOut,
                "connect deadline elapsed",
            ));
            break;
        }
        match std::net::TcpStream::connect_timeout(&addr, remaining) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }
    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
    }))
}
