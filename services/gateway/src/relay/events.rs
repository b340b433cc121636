//! Link lifecycle events.
//!
//! Links report each step of their lifecycle, including every step of the
//! close cascade, to a [`CloseObserver`]. [`TracingObserver`] logs them when
//! close tracing is enabled; [`RecordingObserver`] keeps them in memory.

use std::fmt;
use std::net::SocketAddr;

use parking_lot::Mutex;
use portgate_aio::{CloseReason, SocketId};
use tracing::info;

/// One of the two sockets of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// The accepted client connection.
    Downstream,
    /// The connection to the relay target.
    Upstream,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Downstream => Side::Upstream,
            Side::Upstream => Side::Downstream,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Downstream => "downstream",
            Side::Upstream => "upstream",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that happened to a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Downstream accepted and the first read armed.
    Accepted { peer: Option<SocketAddr> },
    /// Upstream connect succeeded.
    UpstreamConnected,
    /// Upstream connect failed; the link is being torn down.
    UpstreamConnectFailed { error: String },
    /// A socket delivered its disconnection notification.
    SideClosed { side: Side, reason: CloseReason },
    /// The link asked the given side to close gracefully.
    CascadeClose { side: Side },
    /// The link asked the registry to forget it.
    Removed {
        from_downstream: u64,
        from_upstream: u64,
    },
}

/// Hook called at each lifecycle step.
pub trait CloseObserver: Send + Sync {
    fn on_event(&self, link_id: SocketId, event: &LinkEvent);
}

/// Logs events at info level when enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver {
    verbose: bool,
}

impl TracingObserver {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl CloseObserver for TracingObserver {
    fn on_event(&self, link_id: SocketId, event: &LinkEvent) {
        if !self.verbose {
            return;
        }

        match event {
            LinkEvent::Accepted { peer } => {
                info!(link_id, peer = ?peer, "Link accepted");
            }
            LinkEvent::UpstreamConnected => {
                info!(link_id, "Upstream connected");
            }
            LinkEvent::UpstreamConnectFailed { error } => {
                info!(link_id, error = %error, "Upstream connect failed");
            }
            LinkEvent::SideClosed { side, reason } => {
                info!(link_id, side = %side, reason = %reason, "Side closed");
            }
            LinkEvent::CascadeClose { side } => {
                info!(link_id, side = %side, "Cascading close");
            }
            LinkEvent::Removed {
                from_downstream,
                from_upstream,
            } => {
                info!(
                    link_id,
                    from_downstream = from_downstream,
                    from_upstream = from_upstream,
                    "Link removed"
                );
            }
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<(SocketId, LinkEvent)>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// All events so far, in arrival order.
    pub fn events(&self) -> Vec<(SocketId, LinkEvent)> {
        self.events.lock().clone()
    }

    /// Events for one link, in arrival order.
    pub fn events_for(&self, link_id: SocketId) -> Vec<LinkEvent> {
        self.events
            .lock()
            .iter()
            .filter(|(id, _)| *id == link_id)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Ids of every link that was accepted.
    pub fn link_ids(&self) -> Vec<SocketId> {
        self.events
            .lock()
            .iter()
            .filter(|(_, e)| matches!(e, LinkEvent::Accepted { .. }))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Number of removal requests issued by one link.
    pub fn removals_for(&self, link_id: SocketId) -> usize {
        self.count(|id, e| id == link_id && matches!(e, LinkEvent::Removed { .. }))
    }

    /// Number of removal requests issued by all links.
    pub fn removals(&self) -> usize {
        self.count(|_, e| matches!(e, LinkEvent::Removed { .. }))
    }

    pub fn count<F>(&self, predicate: F) -> usize
    where
        F: Fn(SocketId, &LinkEvent) -> bool,
    {
        self.events
            .lock()
            .iter()
            .filter(|(id, e)| predicate(*id, e))
            .count()
    }
}

impl CloseObserver for RecordingObserver {
    fn on_event(&self, link_id: SocketId, event: &LinkEvent) {
        self.events.lock().push((link_id, event.clone()));
    }
}
