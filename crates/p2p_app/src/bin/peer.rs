//! Headless peer: joins the configured relay, logs every event and keeps
//! the node alive until ctrl-c.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use p2p_app::{describe, init_tracing, load_config, Node, DEFAULT_CONFIG_FILE};
use p2p_mesh::NetEvent;

#[tokio::main]
async fn main() -> Result<()> {
    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let config = load_config(&path)?;
    init_tracing(&config.log_level);

    let node = Node::bind(config).await?;
    node.overlay().on_event(Arc::new(|event: &NetEvent| {
        tracing::info!("{}", describe(event));
    }));

    match node.join_relay().await {
        Some(peer_id) => tracing::info!("peer_id    = {peer_id}"),
        None => tracing::info!("running without a relay"),
    }
    tracing::info!("listening  = {}", node.local_addr());

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    tracing::info!("shutting down...");
    node.shutdown().await;
    Ok(())
}
