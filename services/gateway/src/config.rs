//! Gateway configuration.
//!
//! Values come from command-line flags with environment fallbacks and stay
//! fixed for the lifetime of the process.

use std::fmt;
use std::time::Duration;

use anyhow::{ensure, Result};
use clap::Parser;
use portgate_aio::READ_CHUNK_SIZE;

/// Default upstream connect timeout in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1000;

/// Default number of I/O worker threads.
pub const DEFAULT_WORKER_THREADS: usize = 20;

/// Default time `stop(true)` waits for links to finish on their own.
pub const DEFAULT_DRAIN_TIMEOUT_MS: u64 = 5000;

/// The single relay target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
}

impl UpstreamTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
        }
    }
}

impl fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Immutable gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address to listen on.
    pub bind_host: String,

    /// Port to listen on (0 picks an ephemeral port).
    pub bind_port: u16,

    /// Where every accepted connection is relayed.
    pub upstream: UpstreamTarget,

    /// Bytes requested per receive.
    pub read_chunk_size: usize,

    /// I/O worker threads.
    pub worker_threads: usize,

    /// Log every close-cascade step.
    pub trace_close_cascade: bool,

    /// Let live links finish on their own at shutdown.
    pub drain_on_shutdown: bool,

    /// Upper bound on the shutdown drain.
    pub drain_timeout: Duration,

    /// Period of the connection-count log line.
    pub stats_interval: Option<Duration>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl GatewayConfig {
    /// Configuration with defaults for everything but the endpoints.
    pub fn new(bind_host: impl Into<String>, bind_port: u16, upstream: UpstreamTarget) -> Self {
        Self {
            bind_host: bind_host.into(),
            bind_port,
            upstream,
            read_chunk_size: READ_CHUNK_SIZE,
            worker_threads: DEFAULT_WORKER_THREADS,
            trace_close_cascade: false,
            drain_on_shutdown: true,
            drain_timeout: Duration::from_millis(DEFAULT_DRAIN_TIMEOUT_MS),
            stats_interval: None,
            log_level: "info".to_string(),
        }
    }

    /// `host:port` the listener binds to.
    pub fn bind_addr(&self) -> String {
        if self.bind_host.contains(':') {
            format!("[{}]:{}", self.bind_host, self.bind_port)
        } else {
            format!("{}:{}", self.bind_host, self.bind_port)
        }
    }

    /// Reject configurations the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.bind_host.is_empty(), "Listen host must not be empty.");
        ensure!(
            !self.upstream.host.is_empty(),
            "Upstream host must not be empty. Set PORTGATE_UPSTREAM_HOST."
        );
        ensure!(
            self.upstream.port != 0,
            "Upstream port must be between 1 and 65535."
        );
        ensure!(
            !self.upstream.connect_timeout.is_zero(),
            "Connect timeout must be at least 1 millisecond."
        );
        ensure!(self.read_chunk_size > 0, "Read chunk size must be positive.");
        ensure!(self.worker_threads > 0, "Worker thread count must be positive.");
        Ok(())
    }
}

/// Command-line flags, each with an environment fallback.
#[derive(Debug, Parser)]
#[command(name = "portgate", version, about = "Raw TCP gateway to a single upstream")]
pub struct Args {
    /// Address to listen on.
    #[arg(long, env = "PORTGATE_LISTEN_HOST", default_value = "0.0.0.0")]
    pub listen_host: String,

    /// Port to listen on.
    #[arg(long, env = "PORTGATE_LISTEN_PORT")]
    pub listen_port: u16,

    /// Upstream host every connection is relayed to.
    #[arg(long, env = "PORTGATE_UPSTREAM_HOST")]
    pub upstream_host: String,

    /// Upstream port.
    #[arg(long, env = "PORTGATE_UPSTREAM_PORT")]
    pub upstream_port: u16,

    /// Upstream connect timeout (milliseconds).
    #[arg(long, env = "PORTGATE_CONNECT_TIMEOUT_MS", default_value_t = DEFAULT_CONNECT_TIMEOUT_MS)]
    pub connect_timeout_ms: u64,

    /// I/O worker threads.
    #[arg(long, env = "PORTGATE_WORKERS", default_value_t = DEFAULT_WORKER_THREADS)]
    pub workers: usize,

    /// Bytes requested per receive.
    #[arg(long, env = "PORTGATE_READ_CHUNK", default_value_t = READ_CHUNK_SIZE)]
    pub read_chunk: usize,

    /// Log every close-cascade step at info level.
    #[arg(long, env = "PORTGATE_TRACE_CLOSE")]
    pub trace_close: bool,

    /// Force-close live connections at shutdown instead of draining.
    #[arg(long, env = "PORTGATE_NO_DRAIN")]
    pub no_drain: bool,

    /// Upper bound on the shutdown drain (milliseconds).
    #[arg(long, env = "PORTGATE_DRAIN_TIMEOUT_MS", default_value_t = DEFAULT_DRAIN_TIMEOUT_MS)]
    pub drain_timeout_ms: u64,

    /// Log the connection count every N seconds (0 disables).
    #[arg(long, env = "PORTGATE_STATS_INTERVAL_SECS", default_value_t = 0)]
    pub stats_interval_secs: u64,

    /// Log level, used when RUST_LOG is unset.
    #[arg(long, env = "PORTGATE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    /// Build and validate the gateway configuration.
    pub fn into_config(self) -> Result<GatewayConfig> {
        let upstream = UpstreamTarget {
            host: self.upstream_host,
            port: self.upstream_port,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        };

        let config = GatewayConfig {
            read_chunk_size: self.read_chunk,
            worker_threads: self.workers,
            trace_close_cascade: self.trace_close,
            drain_on_shutdown: !self.no_drain,
            drain_timeout: Duration::from_millis(self.drain_timeout_ms),
            stats_interval: (self.stats_interval_secs > 0)
                .then(|| Duration::from_secs(self.stats_interval_secs)),
            log_level: self.log_level,
            ..GatewayConfig::new(self.listen_host, self.listen_port, upstream)
        };

        config.validate()?;
        Ok(config)
    }
}
