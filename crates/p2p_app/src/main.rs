use std::path::PathBuf;

use anyhow::{Context, Result};
use p2p_app::{init_tracing, load_config, DEFAULT_CONFIG_FILE};
use p2p_relay::RelayServer;

fn config_path() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config(&config_path())?;
    init_tracing(&config.log_level);

    let server_config = config.relay_server_config();
    tracing::info!("relay server starting...");
    tracing::info!("bind          = {}:{}", server_config.host, server_config.port);
    tracing::info!("peer_timeout  = {:?}", server_config.peer_timeout);
    tracing::info!("sweep         = {:?}", server_config.sweep_interval);

    let server = RelayServer::bind(server_config)
        .await
        .context("bind relay server")?;

    let serving = server.clone();
    let mut serve = tokio::spawn(async move { serving.serve().await });

    tokio::select! {
        result = &mut serve => {
            result.context("relay server task")?.context("serve")?;
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("wait for ctrl-c")?;
            tracing::info!("shutting down...");
            server.shutdown().await;
            serve.await.context("relay server task")?.context("serve")?;
        }
    }
    Ok(())
}
