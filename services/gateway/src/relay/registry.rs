//! Gateway: listener, accept loop, and the registry of live links.
//!
//! The registry map is the only long-lived owner of a [`Link`]. Links ask to
//! be removed through [`ConnectionRemover`]; the removed link is dropped
//! after the map lock is released, since dropping a link waits for its
//! sockets' pending callbacks.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use portgate_aio::{AsyncSocket, IoNotifier, ReactorNotifier, SocketId};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use super::events::{CloseObserver, LinkEvent, TracingObserver};
use super::link::{ConnectionRemover, Link, LinkSettings};
use crate::config::GatewayConfig;
use crate::error::GatewayError;

/// How often `stop` re-checks the connection count.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound on waiting for force-closed links to remove themselves.
const FORCE_CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Gateway counters.
#[derive(Debug, Default)]
pub struct GatewayStats {
    /// Connections accepted since start.
    pub connections_accepted: AtomicU64,
    /// Links removed from the registry since start.
    pub connections_removed: AtomicU64,
    /// Links torn down because the upstream was unreachable.
    pub upstream_connect_failures: AtomicU64,
}

/// Counts connect failures before handing events to the configured observer.
struct StatsObserver {
    stats: Arc<GatewayStats>,
    inner: Arc<dyn CloseObserver>,
}

impl CloseObserver for StatsObserver {
    fn on_event(&self, link_id: SocketId, event: &LinkEvent) {
        if let LinkEvent::UpstreamConnectFailed { .. } = event {
            self.stats
                .upstream_connect_failures
                .fetch_add(1, Ordering::Relaxed);
        }
        self.inner.on_event(link_id, event);
    }
}

struct Registry {
    links: Mutex<HashMap<SocketId, Arc<Link>>>,
    stats: Arc<GatewayStats>,
}

impl Registry {
    fn new() -> Self {
        Self {
            links: Mutex::new(HashMap::new()),
            stats: Arc::new(GatewayStats::default()),
        }
    }

    fn insert(&self, link: Arc<Link>) {
        self.links.lock().insert(link.id(), link);
    }

    fn len(&self) -> usize {
        self.links.lock().len()
    }

    fn snapshot(&self) -> Vec<Arc<Link>> {
        self.links.lock().values().cloned().collect()
    }
}

impl ConnectionRemover for Registry {
    fn remove_connection(&self, id: SocketId) -> bool {
        let removed = self.links.lock().remove(&id);
        match removed {
            Some(link) => {
                self.stats
                    .connections_removed
                    .fetch_add(1, Ordering::Relaxed);
                debug!(link_id = id, "Connection removed");
                drop(link);
                true
            }
            None => false,
        }
    }
}

/// A running gateway.
///
/// Accepts on the configured listen address and relays every connection to
/// the configured upstream until [`stop`](Self::stop) is called.
pub struct Gateway {
    registry: Arc<Registry>,
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    drain_timeout: Duration,
}

impl Gateway {
    /// Bind and start accepting, using the tokio reactor on the current runtime.
    ///
    /// Must be called from within a multi-thread runtime.
    pub async fn start(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let notifier: Arc<dyn IoNotifier> = Arc::new(ReactorNotifier::current()?);
        let observer: Arc<dyn CloseObserver> =
            Arc::new(TracingObserver::new(config.trace_close_cascade));
        Self::start_with(config, notifier, observer).await
    }

    /// Bind and start accepting with an explicit notifier and observer.
    pub async fn start_with(
        config: &GatewayConfig,
        notifier: Arc<dyn IoNotifier>,
        observer: Arc<dyn CloseObserver>,
    ) -> Result<Self, GatewayError> {
        let bind_addr = config.bind_addr();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|source| GatewayError::Bind {
                addr: bind_addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| GatewayError::Bind {
            addr: bind_addr,
            source,
        })?;

        let registry = Arc::new(Registry::new());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let settings = Arc::new(LinkSettings::from(config));
        let observer: Arc<dyn CloseObserver> = Arc::new(StatsObserver {
            stats: Arc::clone(&registry.stats),
            inner: observer,
        });

        let accept_loop = AcceptLoop {
            listener,
            registry: Arc::clone(&registry),
            settings,
            notifier,
            observer,
        };
        let accept_task = tokio::spawn(accept_loop.run(shutdown_rx));

        info!(
            bind_addr = %local_addr,
            upstream = %config.upstream,
            "Gateway listening"
        );

        Ok(Self {
            registry,
            local_addr,
            shutdown,
            accept_task: Mutex::new(Some(accept_task)),
            drain_timeout: config.drain_timeout,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live links.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn stats(&self) -> &GatewayStats {
        &self.registry.stats
    }

    /// Drop a link from the registry. Returns false if it was not there.
    pub fn remove_connection(&self, id: SocketId) -> bool {
        self.registry.remove_connection(id)
    }

    /// Stop accepting and tear down the live links.
    ///
    /// With `drain` the links get up to the configured drain timeout to
    /// finish on their own; whatever is left is force-closed.
    pub async fn stop(&self, drain: bool) {
        let _ = self.shutdown.send(true);
        let accept_task = self.accept_task.lock().take();
        if let Some(task) = accept_task {
            if let Err(e) = task.await {
                error!(error = %e, "Accept loop panicked");
            }
        }

        let live = self.connection_count();
        info!(live_connections = live, drain, "Gateway stopping");

        if drain && live > 0 {
            if self.wait_until_empty(self.drain_timeout).await {
                info!("Gateway drained");
                return;
            }
            warn!(
                remaining = self.connection_count(),
                "Drain timed out; closing remaining connections"
            );
        }

        // Snapshot first: closing can re-enter the registry.
        for link in self.registry.snapshot() {
            link.close(true);
        }

        if !self.wait_until_empty(FORCE_CLOSE_GRACE).await {
            warn!(
                remaining = self.connection_count(),
                "Connections still registered after shutdown"
            );
        }
        info!("Gateway stopped");
    }

    async fn wait_until_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.connection_count() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(STOP_POLL_INTERVAL).await;
        }
    }
}

struct AcceptLoop {
    listener: TcpListener,
    registry: Arc<Registry>,
    settings: Arc<LinkSettings>,
    notifier: Arc<dyn IoNotifier>,
    observer: Arc<dyn CloseObserver>,
}

impl AcceptLoop {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => self.on_accept(stream, peer_addr),
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        // Brief sleep to avoid tight loop on persistent errors
                        sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
        debug!("Accept loop stopped");
    }

    fn on_accept(&self, stream: tokio::net::TcpStream, peer_addr: SocketAddr) {
        self.registry
            .stats
            .connections_accepted
            .fetch_add(1, Ordering::Relaxed);

        let socket = AsyncSocket::from_stream(Arc::clone(&self.notifier), stream);
        let remover: Weak<Registry> = Arc::downgrade(&self.registry);
        let link = Arc::new(Link::new(
            socket,
            Arc::clone(&self.settings),
            Arc::clone(&self.notifier),
            remover,
            Arc::clone(&self.observer),
        ));

        debug!(link_id = link.id(), peer_addr = %peer_addr, "Connection accepted");

        // Registered before the first read so removal always finds it.
        self.registry.insert(Arc::clone(&link));
        link.start();
    }
}
