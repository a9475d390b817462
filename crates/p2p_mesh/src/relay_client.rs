//! Relay client: keeps one control connection to a relay server, registers,
//! heartbeats, discovers peers and routes messages through the relay when no
//! direct socket exists.
//!
//! Replies on the control connection arrive in command order, so every
//! command that expects one pushes a `Pending` entry before it is written and
//! the receive task pops them front to back. Pushes (`relayed`) are told
//! apart by shape and never consume an entry.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use p2p_proto::wire::{decode_json, encode_json, read_frame, read_json, write_frame, write_json};
use p2p_proto::{
    Command, NetError, RelayContent, Relayed, Response, Result, ServerMessage, TypedContent,
};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{oneshot, Mutex, Notify, RwLock};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{Envelope, NetEvent, Payload};
use crate::overlay::{dial, DirectOverlay};
use crate::peer::{PeerAddr, PeerHandle};

/// How long a closing session waits for its `disconnect` to go out.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// File name carried by relayed copies of non-UTF-8 broadcasts.
pub const BINARY_PAYLOAD_NAME: &str = "message.bin";

#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// Address announced in `register`; other peers dial it on upgrade.
    pub advertise_ip: String,
    pub advertise_port: u16,
    pub heartbeat_interval: Duration,
    pub discovery_interval: Duration,
    pub reconnect_backoff: Duration,
    pub connect_timeout: Duration,
    /// How long to wait for the relay's answer to `register` or `get_peers`.
    pub response_timeout: Duration,
    /// Unapproved relay-only peers not heard from for this long are forgotten.
    pub peer_timeout: Duration,
    pub auto_reconnect: bool,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            advertise_ip: "127.0.0.1".into(),
            advertise_port: 0,
            heartbeat_interval: Duration::from_secs(30),
            discovery_interval: Duration::from_secs(60),
            reconnect_backoff: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
            peer_timeout: Duration::from_secs(120),
            auto_reconnect: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationResult {
    /// Relay-assigned id. A reconnect yields a fresh one.
    pub peer_id: String,
    pub relay: PeerAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayStatus {
    pub connected: bool,
    pub peer_id: Option<String>,
    pub relay: Option<PeerAddr>,
    pub direct_peers: usize,
    pub relay_peers: usize,
}

impl std::fmt::Display for RelayStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.relay, &self.peer_id) {
            (Some(relay), Some(id)) if self.connected => {
                write!(f, "connected to relay {relay} as {id}")?
            }
            _ => write!(f, "not connected to a relay")?,
        }
        write!(
            f,
            "; {} direct peer(s), {} relay peer(s)",
            self.direct_peers, self.relay_peers
        )
    }
}

/// What to do with the next reply on the control connection.
enum Pending {
    Reply(oneshot::Sender<Response>),
    Heartbeat,
    Relay { target: String },
}

/// One registration on one control connection.
struct Session {
    peer_id: String,
    relay: PeerAddr,
    writer: Mutex<OwnedWriteHalf>,
    write_timeout: Duration,
    pending: StdMutex<VecDeque<Pending>>,
    cancel: CancellationToken,
    lost_reason: StdMutex<Option<String>>,
}

impl Session {
    fn new(
        peer_id: String,
        relay: PeerAddr,
        writer: OwnedWriteHalf,
        write_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            peer_id,
            relay,
            writer: Mutex::new(writer),
            write_timeout,
            pending: StdMutex::new(VecDeque::new()),
            cancel,
            lost_reason: StdMutex::new(None),
        }
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<Pending>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_live(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Write one command. A write that fails, stalls past the write
    /// timeout or is overtaken by cancellation ends the session.
    async fn send(&self, cmd: &Command, expect: Option<Pending>) -> Result<()> {
        if !self.is_live() {
            return Err(NetError::NotConnected);
        }
        let data = encode_json(cmd)?;
        let written = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(NetError::NotConnected),
            written = self.write(&data, expect) => written,
        };
        if let Err(e) = &written {
            self.lose(format!("{} failed: {e}", cmd.name()));
        }
        written
    }

    /// The pending entry is queued under the writer lock so queue order
    /// always matches wire order.
    async fn write(&self, data: &[u8], expect: Option<Pending>) -> Result<()> {
        let mut writer = self.writer.lock().await;
        if let Some(entry) = expect {
            self.pending().push_back(entry);
        }
        match timeout(self.write_timeout, write_frame(&mut *writer, data)).await {
            Ok(written) => written,
            Err(_) => Err(NetError::TransportLost(format!(
                "relay accepted no bytes for {:?}",
                self.write_timeout
            ))),
        }
    }

    /// Mark the session dead. The first reason wins.
    fn lose(&self, reason: impl Into<String>) {
        {
            let mut slot = self.lost_reason.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                *slot = Some(reason.into());
            }
        }
        self.cancel.cancel();
        // waiting callers see their oneshot close instead of timing out
        self.pending().clear();
    }

    fn lost_reason(&self) -> String {
        self.lost_reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| "connection closed".into())
    }

    /// Best-effort `disconnect`, then close the socket.
    async fn retire(&self) {
        if self.is_live() {
            let cmd = Command::Disconnect {
                peer_id: self.peer_id.clone(),
            };
            match timeout(DISCONNECT_GRACE, self.send(&cmd, None)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("disconnect not delivered: {e}"),
                Err(_) => debug!("disconnect not delivered within {DISCONNECT_GRACE:?}"),
            }
        }
        self.lose("session closed");
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.shutdown().await.ok();
        }
    }
}

struct ClientInner {
    overlay: DirectOverlay,
    config: RelayClientConfig,
    session: RwLock<Option<Arc<Session>>>,
    /// Relay to return to after a lost session. Set on first success.
    target: StdMutex<Option<PeerAddr>>,
    wake: Notify,
    register_lock: Mutex<()>,
    cancel: CancellationToken,
    shut_down: AtomicBool,
}

/// Relay-assisted layer over a `DirectOverlay`. Clones share state.
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<ClientInner>,
}

impl RelayClient {
    /// Wrap `overlay` and spawn the maintenance loop (heartbeat, discovery,
    /// reconnect, relay-peer expiry). Must be called inside a Tokio runtime.
    pub fn start(overlay: DirectOverlay, config: RelayClientConfig) -> Self {
        let client = Self {
            inner: Arc::new(ClientInner {
                overlay,
                config,
                session: RwLock::new(None),
                target: StdMutex::new(None),
                wake: Notify::new(),
                register_lock: Mutex::new(()),
                cancel: CancellationToken::new(),
                shut_down: AtomicBool::new(false),
            }),
        };
        let worker = client.clone();
        tokio::spawn(async move { worker.maintain().await });
        client
    }

    pub fn overlay(&self) -> &DirectOverlay {
        &self.inner.overlay
    }

    fn emit(&self, event: NetEvent) {
        self.inner.overlay.emit(event);
    }

    fn target(&self) -> MutexGuard<'_, Option<PeerAddr>> {
        self.inner.target.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn current_session(&self) -> Option<Arc<Session>> {
        self.inner.session.read().await.clone()
    }

    async fn live_session(&self) -> Option<Arc<Session>> {
        self.current_session().await.filter(|s| s.is_live())
    }

    pub async fn is_connected(&self) -> bool {
        self.live_session().await.is_some()
    }

    pub async fn peer_id(&self) -> Option<String> {
        self.live_session().await.map(|s| s.peer_id.clone())
    }

    pub async fn status(&self) -> RelayStatus {
        let session = self.live_session().await;
        let peers = self.inner.overlay.peers().await;
        RelayStatus {
            connected: session.is_some(),
            peer_id: session.as_ref().map(|s| s.peer_id.clone()),
            relay: session.as_ref().map(|s| s.relay.clone()),
            direct_peers: peers.iter().filter(|p| p.is_direct()).count(),
            relay_peers: peers.iter().filter(|p| p.id.is_some()).count(),
        }
    }

    /// Peers known through the relay, upgraded or not.
    pub async fn relay_peers(&self) -> Vec<PeerHandle> {
        self.inner.overlay.relay_peers().await
    }

    /// Open the control connection and register. Does not retry on
    /// failure; once a registration has succeeded, lost sessions are
    /// re-established by the maintenance loop.
    pub async fn connect_to_relay(&self, host: &str, port: u16) -> Result<RegistrationResult> {
        let relay = PeerAddr::new(host, port);
        let result = self.register(&relay).await?;
        *self.target() = Some(relay);
        self.inner.wake.notify_one();
        Ok(result)
    }

    async fn register(&self, relay: &PeerAddr) -> Result<RegistrationResult> {
        let _guard = self.inner.register_lock.lock().await;
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(NetError::NotConnected);
        }

        match self.open_session(relay).await {
            Ok((session, reader)) => {
                let previous = self.inner.session.write().await.replace(session.clone());
                if let Some(previous) = previous {
                    previous.retire().await;
                }
                let receiver = self.clone();
                let receiving = session.clone();
                tokio::spawn(async move { receiver.receive(receiving, reader).await });

                info!("registered with relay {relay} as {}", session.peer_id);
                self.emit(NetEvent::RelayConnected {
                    peer_id: session.peer_id.clone(),
                    relay: relay.clone(),
                });
                self.emit(NetEvent::status(format!(
                    "Connected to relay server {relay} as {}",
                    session.peer_id
                )));
                Ok(RegistrationResult {
                    peer_id: session.peer_id.clone(),
                    relay: relay.clone(),
                })
            }
            Err(e) => {
                warn!("registration with relay {relay} failed: {e}");
                let previous = self.inner.session.write().await.take();
                if let Some(previous) = previous {
                    previous.retire().await;
                }
                self.emit(NetEvent::status(format!(
                    "Could not connect to relay server {relay}: {e}"
                )));
                Err(e)
            }
        }
    }

    async fn open_session(&self, relay: &PeerAddr) -> Result<(Arc<Session>, OwnedReadHalf)> {
        let config = &self.inner.config;
        let stream = dial(&relay.host, relay.port, config.connect_timeout).await?;
        let (mut reader, mut writer) = stream.into_split();

        let register = Command::Register {
            ip: config.advertise_ip.clone(),
            port: config.advertise_port,
        };
        write_json(&mut writer, &register).await?;

        let reply: Response = match timeout(config.response_timeout, read_json(&mut reader)).await {
            Ok(Ok(Some(reply))) => reply,
            Ok(Ok(None)) => {
                return Err(NetError::TransportLost(
                    "relay closed the connection during registration".into(),
                ))
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(NetError::Protocol(format!(
                    "no registration reply within {:?}",
                    config.response_timeout
                )))
            }
        };
        let peer_id = reply
            .into_result()?
            .peer_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| NetError::Protocol("registration reply carried no peer_id".into()))?;

        let session = Session::new(
            peer_id,
            relay.clone(),
            writer,
            self.inner.overlay.config().write_timeout,
            self.inner.cancel.child_token(),
        );
        Ok((Arc::new(session), reader))
    }

    async fn maintain(self) {
        loop {
            if self.inner.cancel.is_cancelled() {
                break;
            }
            match self.current_session().await {
                Some(session) if session.is_live() => self.tend(&session).await,
                Some(session) => self.session_lost(&session).await,
                None => {
                    let target = self.target().clone();
                    match target {
                        Some(relay) if self.inner.config.auto_reconnect => {
                            tokio::select! {
                                _ = self.inner.cancel.cancelled() => break,
                                _ = tokio::time::sleep(self.inner.config.reconnect_backoff) => {}
                            }
                            if self.current_session().await.is_none() {
                                info!("reconnecting to relay {relay}");
                                if let Err(e) = self.register(&relay).await {
                                    debug!("reconnect attempt failed: {e}");
                                }
                            }
                        }
                        _ => tokio::select! {
                            _ = self.inner.cancel.cancelled() => break,
                            _ = self.inner.wake.notified() => {}
                        },
                    }
                }
            }
        }
        debug!("relay maintenance loop stopped");
    }

    /// Run heartbeat and discovery timers until the session dies.
    async fn tend(&self, session: &Arc<Session>) {
        let config = &self.inner.config;
        let mut heartbeat = interval_at(
            Instant::now() + config.heartbeat_interval,
            config.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut discovery = interval_at(
            Instant::now() + config.discovery_interval,
            config.discovery_interval,
        );
        discovery.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = session.cancel.cancelled() => return,
                _ = heartbeat.tick() => {
                    let cmd = Command::Heartbeat { peer_id: session.peer_id.clone() };
                    if let Err(e) = session.send(&cmd, Some(Pending::Heartbeat)).await {
                        warn!("heartbeat failed: {e}");
                        return;
                    }
                    debug!("heartbeat sent as {}", session.peer_id);
                }
                _ = discovery.tick() => {
                    if let Err(e) = self.discover_peers().await {
                        debug!("periodic discovery failed: {e}");
                    }
                    let expired = self.inner.overlay.prune_relay_peers(config.peer_timeout).await;
                    for peer in expired {
                        debug!("forgot idle relay peer {peer}");
                    }
                }
            }
        }
    }

    async fn session_lost(&self, session: &Arc<Session>) {
        {
            let mut slot = self.inner.session.write().await;
            match slot.as_ref() {
                Some(current) if Arc::ptr_eq(current, session) => *slot = None,
                _ => return,
            }
        }
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return;
        }
        let reason = session.lost_reason();
        warn!("lost relay connection to {}: {reason}", session.relay);
        self.emit(NetEvent::RelayLost {
            reason: reason.clone(),
        });
        self.emit(NetEvent::status(format!(
            "Disconnected from relay server: {reason}"
        )));
    }

    async fn receive(self, session: Arc<Session>, mut reader: OwnedReadHalf) {
        let reason = loop {
            tokio::select! {
                _ = session.cancel.cancelled() => return,
                frame = read_frame(&mut reader) => match frame {
                    Ok(Some(data)) => self.handle_frame(&session, &data).await,
                    Ok(None) => break "relay closed the connection".to_string(),
                    Err(e) => break e.to_string(),
                }
            }
        };
        session.lose(reason);
    }

    async fn handle_frame(&self, session: &Session, data: &[u8]) {
        match decode_json::<ServerMessage>(data) {
            Ok(ServerMessage::Relayed(msg)) => self.deliver_relayed(msg).await,
            Ok(ServerMessage::Response(reply)) => self.settle(session, reply),
            Err(e) => warn!("dropping unreadable frame from relay: {e}"),
        }
    }

    async fn deliver_relayed(&self, msg: Relayed) {
        let address = PeerAddr::new(msg.sender_ip, msg.sender_port);
        let (peer, new) = self
            .inner
            .overlay
            .upsert_relay_peer(&msg.sender_id, address)
            .await;
        if new {
            info!("learned about {peer} from a relayed message");
        }

        match msg.content {
            RelayContent::Text(text) => {
                debug!("relayed text from {peer}");
                self.emit(NetEvent::Message(Envelope::from_peer(
                    Payload::Text(text),
                    peer,
                )));
            }
            RelayContent::Typed(TypedContent::FileTransfer(file)) => match file.decode() {
                Ok(data) => {
                    info!("received file {} ({} bytes) from {peer}", file.filename, data.len());
                    self.emit(NetEvent::Message(Envelope::from_peer(
                        Payload::Status(format!(
                            "Received file {} via relay from {peer}",
                            file.filename
                        )),
                        peer.clone(),
                    )));
                    self.emit(NetEvent::Message(Envelope::from_peer(
                        Payload::File {
                            filename: file.filename,
                            data,
                        },
                        peer,
                    )));
                }
                Err(e) => {
                    warn!("discarding file from {peer}: {e}");
                    self.emit(NetEvent::status(format!(
                        "Could not decode file from {peer}: {e}"
                    )));
                }
            },
        }
    }

    fn settle(&self, session: &Session, reply: Response) {
        let next = session.pending().pop_front();
        match next {
            Some(Pending::Reply(tx)) => {
                tx.send(reply).ok();
            }
            Some(Pending::Heartbeat) => {
                if let Err(e) = reply.into_result() {
                    // registration expired on the relay side; start over
                    session.lose(format!("heartbeat rejected: {e}"));
                }
            }
            Some(Pending::Relay { target }) => {
                if let Err(e) = reply.into_result() {
                    warn!("relay to {target} failed: {e}");
                    self.emit(NetEvent::status(format!("Relay to {target} failed: {e}")));
                }
            }
            None => debug!("unsolicited reply from relay: {reply:?}"),
        }
    }

    /// Ask the relay for its peer list and merge it in. Returns every
    /// relay-known peer.
    pub async fn discover_peers(&self) -> Result<Vec<PeerHandle>> {
        let session = self.live_session().await.ok_or(NetError::NotConnected)?;
        let limit = self.inner.config.response_timeout;

        let (tx, rx) = oneshot::channel();
        let cmd = Command::GetPeers {
            peer_id: session.peer_id.clone(),
        };
        session.send(&cmd, Some(Pending::Reply(tx))).await?;
        let reply = match timeout(limit, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                return Err(NetError::TransportLost(
                    "relay connection closed before the peer list arrived".into(),
                ))
            }
            Err(_) => {
                return Err(NetError::Protocol(format!(
                    "no peer list within {limit:?}"
                )))
            }
        };

        let mut fresh = 0;
        for info in reply.into_result()?.peers.unwrap_or_default() {
            if info.peer_id == session.peer_id {
                continue;
            }
            let (peer, new) = self
                .inner
                .overlay
                .upsert_relay_peer(&info.peer_id, PeerAddr::new(info.ip, info.port))
                .await;
            if new {
                fresh += 1;
                info!("discovered {peer} via relay");
            }
        }
        if fresh > 0 {
            self.emit(NetEvent::status(format!(
                "Discovered {fresh} new peer(s) via relay"
            )));
        }
        Ok(self.relay_peers().await)
    }

    /// Try to reach a relay-known peer directly. `Ok(false)` means the peer
    /// stays relay-only (and is approved for relay delivery).
    pub async fn upgrade(&self, peer_id: &str) -> Result<bool> {
        let overlay = &self.inner.overlay;
        let Some(peer) = overlay.peer_by_id(peer_id).await else {
            self.emit(NetEvent::status(format!("Unknown relay peer {peer_id}")));
            return Err(NetError::UnknownPeer(peer_id.to_string()));
        };
        if peer.is_direct() {
            return Ok(true);
        }

        let attempt = match dial(
            &peer.address.host,
            peer.address.port,
            self.inner.config.connect_timeout,
        )
        .await
        {
            Ok(stream) => overlay.attach_to_peer(peer.key, stream).await,
            Err(e) => Err(e),
        };
        match attempt {
            Ok(upgraded) => {
                info!("upgraded {upgraded} to a direct connection");
                self.emit(NetEvent::PeerConnected(upgraded));
                Ok(true)
            }
            Err(e) => {
                warn!("direct connection to {peer} failed: {e}");
                overlay.ensure_approved(peer.key).await;
                self.emit(NetEvent::status(format!(
                    "Direct connection to {peer} failed, will use relay"
                )));
                Ok(false)
            }
        }
    }

    /// Deliver to every approved peer exactly once: direct peers over their
    /// socket, relay-only peers through the relay. Relay copies go as text,
    /// or as a file transfer named [`BINARY_PAYLOAD_NAME`] when `data` is
    /// not UTF-8. Returns the number of successful sends.
    pub async fn send_to_all(&self, data: &[u8]) -> usize {
        let plan = self.inner.overlay.delivery_plan().await;
        let mut delivered = self.inner.overlay.send_direct(plan.direct, data).await;
        if plan.relay.is_empty() {
            return delivered;
        }

        let content = match std::str::from_utf8(data) {
            Ok(text) => RelayContent::from(text),
            Err(_) => {
                debug!("{} byte payload is not UTF-8; relaying it as a file", data.len());
                RelayContent::file(BINARY_PAYLOAD_NAME, data)
            }
        };
        for peer in plan.relay {
            let Some(id) = peer.id.as_deref() else {
                continue;
            };
            if self.send_via_relay(id, content.clone()).await {
                delivered += 1;
            }
        }
        delivered
    }

    /// Returns true once the command is written; delivery failures come
    /// back later as a status message.
    pub async fn send_via_relay(&self, peer_id: &str, content: impl Into<RelayContent>) -> bool {
        let Some(session) = self.live_session().await else {
            debug!("not connected to a relay; cannot send to {peer_id}");
            return false;
        };
        let cmd = Command::RelayMessage {
            peer_id: session.peer_id.clone(),
            target_id: peer_id.to_string(),
            content: content.into(),
        };
        let expect = Pending::Relay {
            target: peer_id.to_string(),
        };
        match session.send(&cmd, Some(expect)).await {
            Ok(()) => true,
            Err(e) => {
                warn!("relay send to {peer_id} failed: {e}");
                false
            }
        }
    }

    pub async fn send_file_via_relay(&self, peer_id: &str, bytes: &[u8], filename: &str) -> bool {
        self.send_via_relay(peer_id, RelayContent::file(filename, bytes))
            .await
    }

    /// Say goodbye to the relay, stop every loop and shut the overlay down.
    /// Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = self.inner.session.write().await.take();
        if let Some(session) = session {
            session.retire().await;
        }
        self.inner.cancel.cancel();
        self.inner.overlay.shutdown().await;
        info!("relay client shut down");
    }
}
