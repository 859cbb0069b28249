//! # loomd
//!
//! A loom peer daemon: joins the swarm, keeps its threads in sync and
//! drains the delivery queues on a timer. With `LOOM_CAFE_HOST=true` it
//! also serves cafe requests from other peers.

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use loom_net::{parse_multiaddrs, spawn_swarm, SwarmConfig};
use loom_node::cafe::CafeHostConfig;
use loom_node::{keys, DiskContentStore, Node, NodeConfig, NodeOptions};
use loom_store::{Database, Datastore};

/// Content above this size is refused.
const MAX_CONTENT_SIZE: usize = 64 * 1024 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Tracing and configuration
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,loom_node=debug")),
        )
        .init();

    info!("Starting loomd v{}", env!("CARGO_PKG_VERSION"));

    let config = NodeConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 2. Keys and storage
    // -----------------------------------------------------------------------
    std::fs::create_dir_all(&config.data_dir)?;
    let identity = keys::load_or_create_identity(&config.data_dir)?;
    let account = keys::load_or_create_account(&config.data_dir)?;

    let db = Database::open_at(&config.data_dir.join("loom.db"), &keys::database_key(&identity))?;
    let datastore = Datastore::new(db);
    let content = Arc::new(DiskContentStore::new(config.data_dir.join("content"), MAX_CONTENT_SIZE).await?);

    // -----------------------------------------------------------------------
    // 3. Network and node
    // -----------------------------------------------------------------------
    let (network, inbound) = spawn_swarm(
        &identity,
        SwarmConfig {
            listen_port: config.listen_port,
            bootstrap: parse_multiaddrs(&config.bootstrap[..]),
        },
    )
    .await?;

    let options = NodeOptions {
        name: config.name.clone(),
        cafe_host: config.cafe_host.then(|| CafeHostConfig {
            open: config.cafe_open,
            ..CafeHostConfig::default()
        }),
    };
    let node = Node::new(
        identity,
        account,
        datastore,
        content,
        Arc::new(network.clone()),
        options,
    )?;

    for (peer, url) in &config.cafes {
        node.service().add_route(*peer, url);
        info!(cafe = %peer.short(), url = %url, "cafe route");
    }

    let dispatch = node.spawn_dispatch(inbound);
    let ticker = node.spawn_ticker(config.flush_interval());

    info!(
        peer = %node.peer_id(),
        address = %node.account().address(),
        interval = ?config.flush_interval(),
        "loomd running"
    );

    // -----------------------------------------------------------------------
    // 4. Run until Ctrl+C
    // -----------------------------------------------------------------------
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");

    ticker.abort();
    dispatch.abort();
    node.flush().await;
    if let Ok(peers) = network.connected_peers().await {
        info!(peers = peers.len(), "Disconnecting from swarm");
    }
    network.shutdown().await;

    let pending = node.datastore().with(|db| db.count_block_messages())?;
    if pending > 0 {
        warn!(pending, "block messages left queued");
    }
    Ok(())
}
