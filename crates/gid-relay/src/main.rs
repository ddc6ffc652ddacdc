//! gid-relay: relay server binary

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gid_relay::{RelayServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting gid-relay server");

    // Load configuration
    let config = ServerConfig::load()?;
    info!(
        max_queue_length = config.max_queue_length,
        outbound_queue_capacity = config.outbound_queue_capacity,
        verify_agent_ids = config.verify_agent_ids,
        "configuration loaded"
    );

    let server = RelayServer::new(config)?;

    if let Err(e) = server.run().await {
        error!("Server error: {}", e);
        return Err(e);
    }

    Ok(())
}
