//! # loom-cafe
//!
//! Always-on cafe host for the loom network.
//!
//! This binary provides:
//! - **Cafe protocol** over the peer swarm: registration, sessions, object
//!   pinning, thread backups and client inboxes
//! - **HTTP API** (axum) carrying the same envelopes for peers that reach
//!   the cafe by URL, plus direct upload routes
//! - **Admin API** for the dev tokens gating registration on a closed cafe

mod api;
mod config;
mod error;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use loom_net::{spawn_swarm, SwarmConfig};
use loom_node::{keys, DiskContentStore, Node, NodeOptions};
use loom_store::{Database, Datastore};

use crate::api::AppState;
use crate::config::CafeConfig;

/// How often the cafe drains its own queues.
const FLUSH_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,loom_cafe=debug,loom_node=debug")),
        )
        .init();

    info!("Starting loom cafe v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = CafeConfig::from_env();
    info!(
        http = %config.http_addr,
        data_dir = %config.data_dir.display(),
        url = %config.public_url,
        open = config.open,
        admin_enabled = config.admin_token.is_some(),
        "Loaded configuration"
    );

    // -----------------------------------------------------------------------
    // 3. Keys and storage
    // -----------------------------------------------------------------------
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating {}", config.data_dir.display()))?;
    let identity = keys::load_or_create_identity(&config.data_dir)?;
    let account = keys::load_or_create_account(&config.data_dir)?;

    let db = Database::open_at(&config.data_dir.join("cafe.db"), &keys::database_key(&identity))?;
    let datastore = Datastore::new(db);
    let content = Arc::new(
        DiskContentStore::new(config.data_dir.join("content"), config.max_blob_size).await?,
    );

    // -----------------------------------------------------------------------
    // 4. Swarm and node
    // -----------------------------------------------------------------------
    let (network, inbound) = spawn_swarm(
        &identity,
        SwarmConfig {
            listen_port: config.listen_port,
            ..SwarmConfig::default()
        },
    )
    .await?;

    let node = Node::new(
        identity,
        account,
        datastore,
        content,
        Arc::new(network.clone()),
        NodeOptions {
            name: "cafe".to_string(),
            cafe_host: Some(config.host_config()),
        },
    )?;
    let host = node
        .cafe_host()
        .cloned()
        .context("node started without a cafe host")?;

    let dispatch = node.spawn_dispatch(inbound);
    let ticker = node.spawn_ticker(FLUSH_INTERVAL);

    info!(
        peer = %node.peer_id(),
        address = %node.account().address(),
        port = config.listen_port,
        "Cafe swarm running in background"
    );

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server until shutdown
    // -----------------------------------------------------------------------
    let state = AppState {
        node: node.clone(),
        host,
        config: Arc::new(config.clone()),
    };

    let result = tokio::select! {
        result = api::serve(state, config.http_addr) => {
            if let Err(e) = &result {
                tracing::error!(error = %e, "HTTP server failed");
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    };

    ticker.abort();
    dispatch.abort();
    node.flush().await;
    network.shutdown().await;

    result
}
