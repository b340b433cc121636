//! Test harness for gateway integration tests.
//!
//! Provides helpers to spawn upstream servers and gateways on loopback and to
//! wait for asynchronous teardown to settle.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};

use portgate::{Gateway, GatewayConfig, RecordingObserver, UpstreamTarget};
use portgate_aio::{IoNotifier, ReactorNotifier};

/// Upstream that echoes whatever it receives.
#[allow(dead_code)]
pub struct EchoUpstream {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub bytes_received: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl EchoUpstream {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let bytes_received = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let bytes_clone = Arc::clone(&bytes_received);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let bytes = Arc::clone(&bytes_clone);
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) => break,
                                            Ok(n) => {
                                                bytes.fetch_add(n as u64, Ordering::Relaxed);
                                                if stream.write_all(&buf[..n]).await.is_err() {
                                                    break;
                                                }
                                            }
                                            Err(_) => break,
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            bytes_received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for EchoUpstream {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Upstream that hands every accepted stream to the test.
#[allow(dead_code)]
pub struct ScriptedUpstream {
    pub addr: SocketAddr,
    accepted: mpsc::UnboundedReceiver<TcpStream>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl ScriptedUpstream {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (tx, accepted) = mpsc::unbounded_channel();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((stream, _)) => {
                                if tx.send(stream).is_err() {
                                    break;
                                }
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            accepted,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    /// Next connection the gateway opened, if one arrives within `wait`.
    pub async fn next(&mut self, wait: Duration) -> Option<TcpStream> {
        tokio::time::timeout(wait, self.accepted.recv())
            .await
            .ok()
            .flatten()
    }
}

impl Drop for ScriptedUpstream {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A loopback port with nothing listening on it.
#[allow(dead_code)]
pub async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

#[allow(dead_code)]
pub fn gateway_config(upstream_port: u16) -> GatewayConfig {
    let mut upstream = UpstreamTarget::new("127.0.0.1", upstream_port);
    upstream.connect_timeout = Duration::from_millis(500);
    let mut config = GatewayConfig::new("127.0.0.1", 0, upstream);
    config.drain_timeout = Duration::from_secs(2);
    config
}

/// Start a gateway on an ephemeral port with a recording observer.
#[allow(dead_code)]
pub async fn spawn_gateway(config: GatewayConfig) -> (Gateway, Arc<RecordingObserver>) {
    let notifier: Arc<dyn IoNotifier> = Arc::new(ReactorNotifier::current().unwrap());
    let observer = Arc::new(RecordingObserver::new());
    let gateway = Gateway::start_with(&config, notifier, observer.clone())
        .await
        .unwrap();
    (gateway, observer)
}

/// Poll `check` until it holds or `wait` elapses.
#[allow(dead_code)]
pub async fn wait_for<F>(wait: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Read until EOF, failing the test if it takes longer than `wait`.
#[allow(dead_code)]
pub async fn read_to_eof(stream: &mut TcpStream, wait: Duration) -> Vec<u8> {
    let mut out = Vec::new();
    tokio::time::timeout(wait, stream.read_to_end(&mut out))
        .await
        .expect("timed out waiting for EOF")
        .expect("read failed");
    out
}

/// Await `fut`, failing the test if it takes longer than `wait`.
#[allow(dead_code)]
pub async fn within<T>(wait: Duration, fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(wait, fut)
        .await
        .expect("operation timed out")
}
