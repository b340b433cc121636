//! portgate
//!
//! Raw TCP gateway. Every accepted connection gets its own connection to a
//! single configured upstream, opened when the client sends its first byte,
//! and bytes are relayed verbatim in both directions until either side goes
//! away.

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use portgate::{Args, Gateway, GatewayConfig};

fn main() -> Result<()> {
    let config = Args::parse().into_config()?;

    // Initialize tracing (prefer RUST_LOG, fallback to PORTGATE_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting portgate");
    info!(
        bind_addr = %config.bind_addr(),
        upstream = %config.upstream,
        connect_timeout_ms = config.upstream.connect_timeout.as_millis() as u64,
        worker_threads = config.worker_threads,
        "Configuration loaded"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .thread_name("portgate-io")
        .enable_all()
        .build()
        .context("failed to build I/O runtime")?;

    runtime.block_on(run(config))
}

async fn run(config: GatewayConfig) -> Result<()> {
    let gateway = Gateway::start(&config).await?;

    match config.stats_interval {
        Some(period) => {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        result.context("failed to listen for shutdown signal")?;
                        break;
                    }
                    _ = ticker.tick() => {
                        info!(
                            live_connections = gateway.connection_count(),
                            accepted = gateway.stats().connections_accepted.load(std::sync::atomic::Ordering::Relaxed),
                            "Gateway stats"
                        );
                    }
                }
            }
        }
        None => {
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for shutdown signal")?;
        }
    }

    info!("Shutdown signal received");
    gateway.stop(config.drain_on_shutdown).await;
    info!("portgate stopped");
    Ok(())
}
