use std::sync::Arc;

use streambed::{Node, NodeConfig, StandaloneController};
use streambed_transport::Bus;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    // Load configuration
    let config = match std::env::args().nth(1) {
        Some(path) => NodeConfig::from_file(&path)?,
        None => NodeConfig::default(),
    };

    tracing::info!("Starting streambed node with node_id={}", config.node_id);

    // Single-process standalone deployment: one bus, one controller, one node.
    let bus = Bus::new();
    let controller = StandaloneController::new();
    let node = Node::start(
        config.clone(),
        Arc::new(bus.handle(config.node_id)),
        controller,
    )
    .await?;

    tokio::signal::ctrl_c().await?;
    node.shutdown().await;

    Ok(())
}
