//! TCP relay.
//!
//! This module provides:
//! - The gateway: listener, accept loop, and registry of live links
//! - Connection links that pair each client with its own upstream connection
//! - Lifecycle events for observing the close cascade
//!
//! ## Architecture
//!
//! ```text
//! Client -> Gateway (accept) -> Link -> AsyncSocket (downstream)
//!                                 |
//!                       first byte: connect
//!                                 |
//!                                 +---> AsyncSocket (upstream) -> Upstream
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use portgate::{Gateway, GatewayConfig, UpstreamTarget};
//!
//! let config = GatewayConfig::new("0.0.0.0", 7000, UpstreamTarget::new("10.0.0.5", 6379));
//! let gateway = Gateway::start(&config).await?;
//! tokio::signal::ctrl_c().await?;
//! gateway.stop(true).await;
//! ```

mod events;
mod link;
mod registry;

pub use events::{CloseObserver, LinkEvent, RecordingObserver, Side, TracingObserver};
pub use link::{ConnectionRemover, Link, LinkSettings, LinkState, LinkStats};
pub use registry::{Gateway, GatewayStats};
