//! `meridian-node` — boots one cluster node: loads configuration, loads or
//! generates this node's identity, wires every subsystem via `NodeHandle`,
//! and runs until a shutdown signal arrives.

use meridian::config::Config;
use meridian::identity::NodeKeyPair;
use meridian::node::NodeHandle;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().json().with_env_filter(filter).init();
}

/// Load this node's keypair from `seed_path`, generating and persisting a
/// fresh one on first boot. The seed file holds the raw 32-byte secret seed;
/// losing it changes the node's identity in gossip and the replicated log.
fn load_or_generate_keypair(seed_path: &Path) -> anyhow::Result<NodeKeyPair> {
    if let Ok(bytes) = std::fs::read(seed_path) {
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("identity seed at {} is not 32 bytes", seed_path.display()))?;
        return Ok(NodeKeyPair::from_seed(&seed));
    }
    let keypair = NodeKeyPair::generate();
    if let Some(parent) = seed_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(seed_path, keypair.seed())?;
    Ok(keypair)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| "meridian.toml".to_string());
    let config = Config::from_file(&PathBuf::from(&config_path))?;

    let seed_path = config.cas.root.join("node.seed");
    let keypair = load_or_generate_keypair(&seed_path)?;
    let node_id = keypair.node_id();

    tracing::info!(node_id = %node_id, config_path = %config_path, "loaded configuration");

    let node = Arc::new(NodeHandle::new(config, keypair).await?);
    let handles = node.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, stopping node");
    node.stop();

    futures::future::join_all(handles).await;
    Ok(())
}
