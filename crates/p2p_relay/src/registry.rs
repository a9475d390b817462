//! Registry of peers attached to this relay and the per-command logic that
//! mutates it. Nothing here does I/O; forwarding only enqueues bytes on the
//! target connection's channel.

use std::collections::HashMap;
use std::time::Duration;

use p2p_proto::messages::{
    MSG_INVALID_PEER_IDS, MSG_NOT_REGISTERED, MSG_UNKNOWN_COMMAND,
};
use p2p_proto::wire::encode_json;
use p2p_proto::{Command, PeerInfo, RelayContent, Relayed, Response};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// The server side of one control connection: where to push frames and how
/// to close it.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    pub id: u64,
    pub tx: mpsc::Sender<Vec<u8>>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub peer_id: String,
    pub ip: String,
    pub port: u16,
    pub last_active: Instant,
    pub conn: ConnHandle,
}

impl RegistryEntry {
    fn is_idle(&self, now: Instant, max_idle: Duration) -> bool {
        now.saturating_duration_since(self.last_active) > max_idle
    }

    fn to_peer_info(&self) -> PeerInfo {
        PeerInfo {
            peer_id: self.peer_id.clone(),
            ip: self.ip.clone(),
            port: self.port,
        }
    }
}

#[derive(Default)]
pub struct RelayRegistry {
    entries: HashMap<String, RegistryEntry>,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        peer_id: String,
        ip: String,
        port: u16,
        conn: ConnHandle,
        now: Instant,
    ) {
        self.entries.insert(
            peer_id.clone(),
            RegistryEntry {
                peer_id,
                ip,
                port,
                last_active: now,
                conn,
            },
        );
    }

    /// Refresh `last_active`. Returns false for unknown ids.
    pub fn touch(&mut self, peer_id: &str, now: Instant) -> bool {
        match self.entries.get_mut(peer_id) {
            Some(entry) => {
                entry.last_active = now;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, peer_id: &str) -> Option<&RegistryEntry> {
        self.entries.get(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.entries.contains_key(peer_id)
    }

    /// Every registered peer other than `peer_id`, in no particular order.
    pub fn peers_except(&self, peer_id: &str) -> Vec<PeerInfo> {
        self.entries
            .values()
            .filter(|e| e.peer_id != peer_id)
            .map(RegistryEntry::to_peer_info)
            .collect()
    }

    pub fn remove(&mut self, peer_id: &str) -> Option<RegistryEntry> {
        self.entries.remove(peer_id)
    }

    /// Remove `peer_id` only if it still belongs to connection `conn_id`.
    pub fn remove_owned(&mut self, peer_id: &str, conn_id: u64) -> Option<RegistryEntry> {
        if self.entries.get(peer_id)?.conn.id == conn_id {
            self.entries.remove(peer_id)
        } else {
            None
        }
    }

    pub fn is_idle(&self, peer_id: &str, now: Instant, max_idle: Duration) -> bool {
        self.entries
            .get(peer_id)
            .map(|e| e.is_idle(now, max_idle))
            .unwrap_or(true)
    }

    /// Remove and return every entry idle for longer than `ttl`. Callers
    /// close the returned connections after the entries are gone.
    pub fn sweep(&mut self, now: Instant, ttl: Duration) -> Vec<RegistryEntry> {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.is_idle(now, ttl))
            .map(|e| e.peer_id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|id| self.entries.remove(id))
            .collect()
    }

    pub fn drain(&mut self) -> Vec<RegistryEntry> {
        self.entries.drain().map(|(_, e)| e).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-connection protocol state.
#[derive(Debug)]
pub struct ConnState {
    pub handle: ConnHandle,
    /// Id issued by the latest `register` on this connection.
    pub peer_id: Option<String>,
}

impl ConnState {
    pub fn new(handle: ConnHandle) -> Self {
        Self {
            handle,
            peer_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Reply(Response),
    /// `disconnect`: the entry is gone; close without replying.
    Close,
}

fn new_peer_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Apply one command from `conn` to the registry.
pub fn handle_command(
    registry: &mut RelayRegistry,
    conn: &mut ConnState,
    cmd: Command,
    now: Instant,
) -> Outcome {
    if let Command::Register { ip, port } = cmd {
        if let Some(old) = conn.peer_id.take() {
            // same connection, new identity; the socket stays open
            registry.remove_owned(&old, conn.handle.id);
        }
        let peer_id = new_peer_id();
        info!("registered peer {peer_id} at {ip}:{port}");
        registry.register(peer_id.clone(), ip, port, conn.handle.clone(), now);
        conn.peer_id = Some(peer_id.clone());
        return Outcome::Reply(Response::registered(peer_id));
    }
    if cmd == Command::Unknown {
        return Outcome::Reply(Response::error(MSG_UNKNOWN_COMMAND));
    }

    let own = match conn.peer_id.as_deref() {
        Some(id) if registry.touch(id, now) => id.to_string(),
        _ => return Outcome::Reply(Response::error(MSG_NOT_REGISTERED)),
    };

    match cmd {
        Command::Heartbeat { peer_id } => {
            if registry.touch(&peer_id, now) {
                Outcome::Reply(Response::success())
            } else {
                Outcome::Reply(Response::error(MSG_NOT_REGISTERED))
            }
        }
        Command::GetPeers { peer_id } => {
            registry.touch(&peer_id, now);
            Outcome::Reply(Response::peer_list(registry.peers_except(&peer_id)))
        }
        Command::RelayMessage {
            peer_id,
            target_id,
            content,
        } => Outcome::Reply(relay(registry, &peer_id, &target_id, content)),
        Command::Disconnect { peer_id } => {
            if peer_id != own {
                debug!("disconnect for {peer_id} arrived on the connection of {own}");
            }
            registry.remove_owned(&own, conn.handle.id);
            conn.peer_id = None;
            info!("peer {own} disconnected");
            Outcome::Close
        }
        Command::Register { .. } | Command::Unknown => {
            Outcome::Reply(Response::error(MSG_UNKNOWN_COMMAND))
        }
    }
}

fn relay(
    registry: &RelayRegistry,
    sender_id: &str,
    target_id: &str,
    content: RelayContent,
) -> Response {
    let (Some(sender), Some(target)) = (registry.get(sender_id), registry.get(target_id)) else {
        return Response::error(MSG_INVALID_PEER_IDS);
    };
    if target.conn.cancel.is_cancelled() {
        return Response::error(MSG_INVALID_PEER_IDS);
    }
    let push = Relayed::new(&sender.peer_id, &sender.ip, sender.port, content);
    let sent = encode_json(&push)
        .map_err(|e| e.to_string())
        .and_then(|bytes| target.conn.tx.try_send(bytes).map_err(|e| e.to_string()));
    match sent {
        Ok(()) => {
            debug!("relayed message from {sender_id} to {target_id}");
            Response::success()
        }
        Err(e) => Response::error(format!("Failed to relay: {e}")),
    }
}
