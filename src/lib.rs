//! kubedeck - Kubernetes dashboard core
//!
//! A library and HTTP service that manages local port-forward tunnels to
//! pods and relays live pod logs and pod lifecycle events to WebSocket
//! clients.
//!
//! # Features
//!
//! - Port-forward sessions with a tracked lifecycle
//! - Local port availability probing
//! - Live log streaming that survives pod restarts
//! - Pod watch relay
//! - Layered configuration and structured logging with tracing
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use kubedeck::{AppState, Config, KubeCluster};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load(None)?;
//!     let bind_address = config.tunnel.bind_address.parse()?;
//!     let cluster = KubeCluster::connect(&config.kube, bind_address).await?;
//!
//!     let listener = tokio::net::TcpListener::bind(config.listen_address()).await?;
//!     let app = kubedeck::api::router(AppState::new(Arc::new(cluster), config));
//!     axum::serve(listener, app).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod cluster;
pub mod config;
pub mod error;
pub mod forwarding;
pub mod kube_cluster;
pub mod logstream;
pub mod probe;
pub mod registry;
pub mod relay;
pub mod session;
pub mod tunnel;
pub mod watch;

pub use api::AppState;
pub use cluster::ClusterClient;
pub use config::Config;
pub use error::{KubedeckError, KubedeckResult};
pub use forwarding::PortPair;
pub use kube_cluster::KubeCluster;
pub use registry::SessionRegistry;
pub use session::{Session, SessionStatus};
pub use tunnel::TunnelEstablisher;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize logging with tracing
///
/// `RUST_LOG` wins when set. Otherwise each `-v` raises the crate's level
/// from `info` to `debug` and then `trace`.
pub fn init_logging(verbosity: u8) -> KubedeckResult<()> {
    let default_filter = match verbosity {
        0 => "kubedeck=info,tower_http=info",
        1 => "kubedeck=debug,tower_http=debug",
        _ => "kubedeck=trace,tower_http=debug,kube=debug",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| KubedeckError::Config(e.to_string()))?;

    Ok(())
}
