//! Process wiring: configuration, tracing setup and a peer node built from
//! a `DirectOverlay` plus a `RelayClient`.

pub mod config;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use p2p_mesh::{DirectOverlay, NetEvent, Payload, RelayClient};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub use config::{load_config, NodeConfig, DEFAULT_CONFIG_FILE};

/// Install the global subscriber. `RUST_LOG` wins over `default_level`.
/// Later calls are ignored.
pub fn init_tracing(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .try_init()
        .ok();
}

/// One peer process: a listening overlay and its relay client.
pub struct Node {
    client: RelayClient,
    local_addr: SocketAddr,
    config: NodeConfig,
}

impl Node {
    /// Bind the local listener and start the relay client. The relay itself
    /// is joined by `join_relay`, so observers can be attached first.
    pub async fn bind(config: NodeConfig) -> Result<Self> {
        let overlay = DirectOverlay::new(config.overlay_config());
        let local_addr = overlay
            .listen(&config.local.host, config.local.port)
            .await
            .context("bind local listener")?;
        let client = RelayClient::start(overlay, config.relay_client_config(local_addr.port()));
        info!("peer listening on {local_addr}");
        Ok(Self {
            client,
            local_addr,
            config,
        })
    }

    /// Register with the configured relay, if any. An unreachable relay is
    /// reported but not fatal; the node keeps working direct-only.
    pub async fn join_relay(&self) -> Option<String> {
        let host = self.config.relay.host.as_deref()?;
        match self.client.connect_to_relay(host, self.config.relay.port).await {
            Ok(registration) => Some(registration.peer_id),
            Err(e) => {
                warn!("relay {host}:{} unavailable: {e}", self.config.relay.port);
                None
            }
        }
    }

    pub fn client(&self) -> &RelayClient {
        &self.client
    }

    pub fn overlay(&self) -> &DirectOverlay {
        self.client.overlay()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(&self) {
        self.client.shutdown().await;
    }
}

/// One-line rendering of an event for logs.
pub fn describe(event: &NetEvent) -> String {
    match event {
        NetEvent::Message(env) => match (env.payload(), env.origin()) {
            (Payload::Status(text), None) => text.clone(),
            (Payload::File { filename, data }, Some(peer)) => {
                format!("{peer} sent file {filename} ({} bytes)", data.len())
            }
            (_, Some(peer)) => format!("{peer}: {}", env.text()),
            (_, None) => env.text().into_owned(),
        },
        NetEvent::PeerPending(peer) => {
            format!("connection from {peer} is waiting for approval (key {})", peer.key)
        }
        NetEvent::PeerConnected(peer) => format!("connected to {peer} ({})", peer.transport),
        NetEvent::PeerApproved(peer) => format!("approved {peer}"),
        NetEvent::PeerLost { peer, reason } => format!("lost {peer}: {reason}"),
        NetEvent::RelayConnected { peer_id, relay } => {
            format!("registered with relay {relay} as {peer_id}")
        }
        NetEvent::RelayLost { reason } => format!("relay connection lost: {reason}"),
        NetEvent::NetworkShutdown => "network shut down".into(),
    }
}
