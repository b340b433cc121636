pub mod config;
pub mod error;
pub mod relay;

pub use config::{Args, GatewayConfig, UpstreamTarget};
pub use error::GatewayError;
pub use relay::{
    CloseObserver, ConnectionRemover, Gateway, GatewayStats, Link, LinkEvent, LinkSettings,
    LinkState, LinkStats, RecordingObserver, Side, TracingObserver,
};
