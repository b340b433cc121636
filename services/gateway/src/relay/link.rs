//! Connection link: one downstream socket relayed to one upstream socket.
//!
//! The upstream connection is opened lazily on the first downstream byte.
//! From then on bytes are pipelined in both directions: each completed read
//! issues a write on the opposite socket and immediately re-arms the read,
//! so at most one read buffer per direction is in flight.
//!
//! ## Close cascade
//!
//! Either socket may report its disconnection first, on any worker thread.
//! The side that closes marks itself closed; if the other side is still
//! open it is asked to close gracefully, and its own disconnection comes
//! back through the same path. Whichever notification finds both sides done
//! sends the single removal request to the registry. The decision is made
//! under the link lock and the lock is never held across a socket call, so
//! the cascade needs no re-entrant locking.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use bytes::Bytes;
use parking_lot::Mutex;
use portgate_aio::{AsyncSocket, CloseReason, IoNotifier, ReadResult, SocketId, READ_CHUNK_SIZE};
use tracing::{debug, debug_span, warn, Span};

use super::events::{CloseObserver, LinkEvent, Side};
use crate::config::{GatewayConfig, UpstreamTarget};

/// Capability a link uses to take itself out of the registry.
pub trait ConnectionRemover: Send + Sync {
    /// Forget the link keyed by `id`. Returns false if it was already gone.
    fn remove_connection(&self, id: SocketId) -> bool;
}

/// Relay settings shared by every link.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub upstream: UpstreamTarget,
    pub read_chunk_size: usize,
}

impl LinkSettings {
    pub fn new(upstream: UpstreamTarget) -> Self {
        Self {
            upstream,
            read_chunk_size: READ_CHUNK_SIZE,
        }
    }
}

impl From<&GatewayConfig> for LinkSettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            upstream: config.upstream.clone(),
            read_chunk_size: config.read_chunk_size,
        }
    }
}

/// Link lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    AwaitingFirstByte,
    Relaying,
    Closing,
    Closed,
}

/// Byte and chunk counters for one link.
#[derive(Debug, Default)]
pub struct LinkStats {
    /// Bytes read from the client.
    pub from_downstream: AtomicU64,
    /// Bytes read from the upstream.
    pub from_upstream: AtomicU64,
    /// Bytes the client side finished sending.
    pub to_downstream: AtomicU64,
    /// Bytes the upstream side finished sending.
    pub to_upstream: AtomicU64,
    /// Relay rounds started from each side.
    pub chunks_from_downstream: AtomicU64,
    pub chunks_from_upstream: AtomicU64,
}

impl LinkStats {
    fn record_read(&self, side: Side, len: usize) {
        let (bytes, chunks) = match side {
            Side::Downstream => (&self.from_downstream, &self.chunks_from_downstream),
            Side::Upstream => (&self.from_upstream, &self.chunks_from_upstream),
        };
        bytes.fetch_add(len as u64, Ordering::Relaxed);
        chunks.fetch_add(1, Ordering::Relaxed);
    }

    fn record_write(&self, side: Side, len: usize) {
        let counter = match side {
            Side::Downstream => &self.to_downstream,
            Side::Upstream => &self.to_upstream,
        };
        counter.fetch_add(len as u64, Ordering::Relaxed);
    }
}

/// What a disconnection notification asks the link to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseAction {
    /// Ask the other side to close gracefully.
    CloseOther,
    /// Send the removal request.
    Remove,
    /// Someone else already sent it.
    Nothing,
}

/// Link state guarded by the link lock.
#[derive(Debug)]
struct LinkFlags {
    state: LinkState,
    relay_established: bool,
    downstream_closed: bool,
    upstream_closed: bool,
    removal_sent: bool,
}

impl LinkFlags {
    fn new() -> Self {
        Self {
            state: LinkState::AwaitingFirstByte,
            relay_established: false,
            downstream_closed: false,
            upstream_closed: false,
            removal_sent: false,
        }
    }

    fn is_open(&self, side: Side) -> bool {
        match side {
            Side::Downstream => !self.downstream_closed,
            Side::Upstream => self.relay_established && !self.upstream_closed,
        }
    }

    fn side_closed(&mut self, side: Side) -> CloseAction {
        match side {
            Side::Downstream => self.downstream_closed = true,
            Side::Upstream => self.upstream_closed = true,
        }

        if self.is_open(side.opposite()) {
            self.state = LinkState::Closing;
            CloseAction::CloseOther
        } else if !self.removal_sent {
            self.removal_sent = true;
            self.state = LinkState::Closed;
            CloseAction::Remove
        } else {
            CloseAction::Nothing
        }
    }

    /// Record a freshly connected upstream, unless the client is already gone.
    fn install_upstream(&mut self) -> bool {
        if self.downstream_closed || self.removal_sent {
            return false;
        }
        self.relay_established = true;
        self.state = LinkState::Relaying;
        true
    }
}

/// A downstream connection and its relay to the upstream.
pub struct Link {
    id: SocketId,
    settings: Arc<LinkSettings>,
    notifier: Arc<dyn IoNotifier>,
    downstream: AsyncSocket,
    upstream: OnceLock<AsyncSocket>,
    flags: Mutex<LinkFlags>,
    stats: LinkStats,
    remover: Weak<dyn ConnectionRemover>,
    observer: Arc<dyn CloseObserver>,
    span: Span,
}

impl Link {
    /// Create a link for an accepted socket. Nothing happens until [`start`](Self::start).
    pub fn new(
        downstream: AsyncSocket,
        settings: Arc<LinkSettings>,
        notifier: Arc<dyn IoNotifier>,
        remover: Weak<dyn ConnectionRemover>,
        observer: Arc<dyn CloseObserver>,
    ) -> Self {
        let id = downstream.id();
        let span = debug_span!("link", link_id = id, peer = ?downstream.peer_addr());
        Self {
            id,
            settings,
            notifier,
            downstream,
            upstream: OnceLock::new(),
            flags: Mutex::new(LinkFlags::new()),
            stats: LinkStats::default(),
            remover,
            observer,
            span,
        }
    }

    /// Registry key: the downstream socket id.
    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn state(&self) -> LinkState {
        self.flags.lock().state
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.downstream.peer_addr()
    }

    /// Register the downstream disconnection handler and arm the first read.
    pub fn start(self: &Arc<Self>) {
        let _enter = self.span.enter();
        let weak = Arc::downgrade(self);
        self.downstream.set_disconnection_handler(move |reason| {
            if let Some(link) = weak.upgrade() {
                link.on_side_closed(Side::Downstream, reason);
            }
        });

        self.observer.on_event(
            self.id,
            &LinkEvent::Accepted {
                peer: self.downstream.peer_addr(),
            },
        );
        self.arm_read(Side::Downstream);
    }

    /// Close the link from outside.
    ///
    /// Graceful closes the client side and lets the cascade take the upstream
    /// down; forced closes both sides at once.
    pub fn close(&self, force: bool) {
        self.downstream.disconnect(force);
        if force {
            if let Some(upstream) = self.upstream.get() {
                upstream.disconnect(true);
            }
        }
    }

    fn socket(&self, side: Side) -> Option<&AsyncSocket> {
        match side {
            Side::Downstream => Some(&self.downstream),
            Side::Upstream => self.upstream.get(),
        }
    }

    fn arm_read(self: &Arc<Self>, side: Side) {
        let Some(socket) = self.socket(side) else {
            return;
        };
        let weak = Arc::downgrade(self);
        socket.async_read(self.settings.read_chunk_size, move |result| {
            if let Some(link) = weak.upgrade() {
                link.on_read(side, result);
            }
        });
    }

    fn on_read(self: &Arc<Self>, side: Side, result: ReadResult) {
        let _enter = self.span.enter();
        // Failures come back through the disconnection handler.
        if !result.success {
            return;
        }

        if side == Side::Downstream && !self.ensure_upstream() {
            return;
        }

        self.forward(side, result.buffer);
    }

    /// Send bytes read on `from` to the other side, then read `from` again.
    fn forward(self: &Arc<Self>, from: Side, buffer: Bytes) {
        let to = from.opposite();
        self.stats.record_read(from, buffer.len());

        if let Some(target) = self.socket(to) {
            let weak = Arc::downgrade(self);
            target.async_write(buffer, move |result| {
                if let Some(link) = weak.upgrade() {
                    link.stats.record_write(to, result.size);
                }
            });
        }

        self.arm_read(from);
    }

    /// Open the upstream connection on the first downstream byte.
    ///
    /// Only the downstream read path calls this and downstream reads are
    /// serialized, so at most one connect is ever attempted.
    fn ensure_upstream(self: &Arc<Self>) -> bool {
        if self.flags.lock().relay_established {
            return true;
        }

        let target = &self.settings.upstream;
        let upstream = AsyncSocket::new(Arc::clone(&self.notifier));
        if let Err(e) = upstream.connect(&target.host, target.port, target.connect_timeout) {
            warn!(
                link_id = self.id,
                upstream = %target,
                error = %e,
                "Upstream connect failed"
            );
            self.observer.on_event(
                self.id,
                &LinkEvent::UpstreamConnectFailed {
                    error: e.to_string(),
                },
            );
            self.downstream.disconnect(true);
            return false;
        }

        let weak = Arc::downgrade(self);
        upstream.set_disconnection_handler(move |reason| {
            if let Some(link) = weak.upgrade() {
                link.on_side_closed(Side::Upstream, reason);
            }
        });

        // Sockets are closed only after the link lock is released: their
        // disconnection handlers take it again.
        let (installed, rejected) = {
            let mut flags = self.flags.lock();
            if flags.install_upstream() {
                // A set error is unreachable while reads are serialized.
                (true, self.upstream.set(upstream).err())
            } else {
                (false, Some(upstream))
            }
        };
        if let Some(socket) = rejected {
            socket.disconnect(true);
        }
        if !installed {
            debug!(link_id = self.id, "Client left during upstream connect");
            return false;
        }

        debug!(
            link_id = self.id,
            upstream = %target,
            "Relay established"
        );
        self.observer.on_event(self.id, &LinkEvent::UpstreamConnected);
        self.arm_read(Side::Upstream);
        true
    }

    fn on_side_closed(self: &Arc<Self>, side: Side, reason: CloseReason) {
        let _enter = self.span.enter();
        let action = self.flags.lock().side_closed(side);
        self.observer
            .on_event(self.id, &LinkEvent::SideClosed { side, reason });

        match action {
            CloseAction::CloseOther => {
                let other = side.opposite();
                self.observer
                    .on_event(self.id, &LinkEvent::CascadeClose { side: other });
                if let Some(socket) = self.socket(other) {
                    socket.disconnect(false);
                }
            }
            CloseAction::Remove => {
                let from_downstream = self.stats.from_downstream.load(Ordering::Relaxed);
                let from_upstream = self.stats.from_upstream.load(Ordering::Relaxed);
                debug!(
                    link_id = self.id,
                    from_downstream = from_downstream,
                    from_upstream = from_upstream,
                    "Connection closed"
                );
                self.observer.on_event(
                    self.id,
                    &LinkEvent::Removed {
                        from_downstream,
                        from_upstream,
                    },
                );
                if let Some(remover) = self.remover.upgrade() {
                    remover.remove_connection(self.id);
                }
            }
            CloseAction::Nothing => {}
        }
    }
}
