//! VM Controller binary
//!
//! Loads configuration from the environment, connects to the cluster and the
//! host netlink socket, and runs until interrupted.

use tracing::info;
use tracing_subscriber::EnvFilter;
use vm_controller::{Config, Controller, ControllerError};

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    // Configure rustls crypto provider before any TLS client is built
    let _ = rustls::crypto::ring::default_provider().install_default();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting VM Controller");

    let config = Config::from_env()?;
    info!("Configuration:");
    info!("  Kubernetes API: {}", config.api_url);
    info!("  Namespaces: {}", config.watch_namespaces.join(", "));
    info!("  Bridge: {} (uplink {}, capacity {})", config.bridge, config.interface, config.bridge_capacity);

    let controller = Controller::new(config).await?;
    controller.run().await?;

    Ok(())
}
