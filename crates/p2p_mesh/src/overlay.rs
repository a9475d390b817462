//! Direct-socket overlay: accepts and dials peers, admits them, fans out
//! messages and dispatches inbound frames to observers.
//!
//! Wire format on every direct connection: [4-byte LE length][payload].
//! One reader task runs per connection, so a silent peer never stalls the
//! others.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use p2p_proto::wire::read_frame;
use p2p_proto::{NetError, Result};
use tokio::io::AsyncRead;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{Envelope, EventHandler, NetEvent, Observers, Payload};
use crate::peer::{Admission, PeerAddr, PeerHandle, PeerKey};
use crate::peer_table::{DeliveryPlan, Link, PeerTable};

#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Upper bound on a single outbound TCP connect.
    pub connect_timeout: Duration,
    /// A peer that accepts no bytes for this long is dropped.
    pub write_timeout: Duration,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
        }
    }
}

struct OverlayInner {
    config: OverlayConfig,
    peers: RwLock<PeerTable>,
    observers: Observers,
    cancel: CancellationToken,
    shut_down: AtomicBool,
}

/// Handle to the overlay. Clones share the same peers and observers.
#[derive(Clone)]
pub struct DirectOverlay {
    inner: Arc<OverlayInner>,
}

/// Open a TCP connection, giving up after `limit`.
pub(crate) async fn dial(host: &str, port: u16, limit: Duration) -> Result<TcpStream> {
    let addr = format!("{host}:{port}");
    match tokio::time::timeout(limit, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true).ok();
            Ok(stream)
        }
        Ok(Err(e)) => Err(NetError::connect(addr, e)),
        Err(_) => Err(NetError::connect(
            addr,
            format!("timed out after {:?}", limit),
        )),
    }
}

impl DirectOverlay {
    pub fn new(config: OverlayConfig) -> Self {
        Self {
            inner: Arc::new(OverlayInner {
                config,
                peers: RwLock::new(PeerTable::new()),
                observers: Observers::new(),
                cancel: CancellationToken::new(),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.inner.config
    }

    pub fn on_event(&self, handler: EventHandler) {
        self.inner.observers.register(handler);
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<NetEvent> {
        self.inner.observers.subscribe()
    }

    pub(crate) fn emit(&self, event: NetEvent) {
        self.inner.observers.emit(event);
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Bind and start accepting. Returns the bound address (useful with
    /// port 0).
    pub async fn listen(&self, host: &str, port: u16) -> Result<SocketAddr> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| NetError::Bind {
                addr: format!("{host}:{port}"),
                source: e,
            })?;
        let local = listener.local_addr().map_err(|e| NetError::Bind {
            addr: format!("{host}:{port}"),
            source: e,
        })?;
        info!("overlay listening on {local}");

        let overlay = self.clone();
        tokio::spawn(async move {
            overlay.accept_loop(listener).await;
        });
        Ok(local)
    }

    async fn accept_loop(self, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        stream.set_nodelay(true).ok();
                        let address = PeerAddr::from(remote);
                        match self.attach_stream(stream, address, Admission::Unconfirmed).await {
                            Ok(peer) => {
                                info!("new connection from {peer}, awaiting approval");
                                self.emit(NetEvent::PeerPending(peer));
                            }
                            Err(e) => debug!("dropping connection from {remote}: {e}"),
                        }
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
        debug!("overlay accept loop stopped");
    }

    /// Dial a peer. The dialer trusts its own intent, so the peer is
    /// Approved immediately. Failure leaves the peer table untouched.
    pub async fn connect(&self, host: &str, port: u16) -> Result<PeerHandle> {
        if self.is_shut_down() {
            return Err(NetError::connect(format!("{host}:{port}"), "overlay is shut down"));
        }
        let stream = match dial(host, port, self.inner.config.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("{e}");
                self.emit(NetEvent::status(format!(
                    "Failed to connect to {host}:{port}: {e}"
                )));
                return Err(e);
            }
        };
        let peer = self
            .attach_stream(stream, PeerAddr::new(host, port), Admission::Approved)
            .await?;
        info!("connected to {peer}");
        self.emit(NetEvent::PeerConnected(peer.clone()));
        Ok(peer)
    }

    async fn attach_stream(
        &self,
        stream: TcpStream,
        address: PeerAddr,
        admission: Admission,
    ) -> Result<PeerHandle> {
        if self.is_shut_down() {
            return Err(NetError::TransportLost("overlay is shut down".into()));
        }
        let (reader, writer) = stream.into_split();
        let link = self.new_link(writer);
        let peer = self
            .inner
            .peers
            .write()
            .await
            .insert_direct(address, admission, link.clone());
        self.spawn_reader(peer.key, link, reader);
        Ok(peer)
    }

    fn new_link(&self, writer: OwnedWriteHalf) -> Arc<Link> {
        Arc::new(Link::new(
            Box::new(writer),
            self.inner.cancel.child_token(),
            self.inner.config.write_timeout,
        ))
    }

    /// Give an existing (relay-known) slot a direct connection.
    pub(crate) async fn attach_to_peer(
        &self,
        key: PeerKey,
        stream: TcpStream,
    ) -> Result<PeerHandle> {
        if self.is_shut_down() {
            return Err(NetError::TransportLost("overlay is shut down".into()));
        }
        let (reader, writer) = stream.into_split();
        let link = self.new_link(writer);
        let (peer, stored) = self.inner.peers.write().await.attach(key, link.clone())?;
        if stored {
            self.spawn_reader(key, link, reader);
        } else {
            debug!("{peer} already has a direct connection; dropping the new one");
            link.close().await;
        }
        Ok(peer)
    }

    fn spawn_reader<R>(&self, key: PeerKey, link: Arc<Link>, mut reader: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let overlay = self.clone();
        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    _ = link.token().cancelled() => return,
                    frame = read_frame(&mut reader) => match frame {
                        Ok(Some(data)) => overlay.dispatch(key, data).await,
                        Ok(None) => break "connection closed".to_string(),
                        Err(e) => break e.to_string(),
                    }
                }
            };
            overlay.drop_link(key, &link, &reason).await;
        });
    }

    async fn dispatch(&self, key: PeerKey, data: Vec<u8>) {
        let origin = {
            let mut peers = self.inner.peers.write().await;
            peers.touch(key);
            peers.get(key).cloned()
        };
        match origin {
            Some(peer) => {
                debug!("received {} bytes from {peer}", data.len());
                self.emit(NetEvent::Message(Envelope::from_peer(
                    Payload::Bytes(data),
                    peer,
                )));
            }
            None => debug!("dropping frame from removed peer {key}"),
        }
    }

    /// Remove a failed link. Only the first caller for a given link emits
    /// `PeerLost`.
    async fn drop_link(&self, key: PeerKey, link: &Arc<Link>, reason: &str) {
        let lost = self.inner.peers.write().await.detach(key, link);
        link.close().await;
        if let Some(peer) = lost {
            info!("lost connection with {peer}: {reason}");
            self.emit(NetEvent::PeerLost {
                peer,
                reason: reason.to_string(),
            });
        }
    }

    pub async fn approve(&self, key: PeerKey) -> Result<PeerHandle> {
        let peer = self.inner.peers.write().await.approve(key)?;
        info!("peer {peer} approved");
        self.emit(NetEvent::PeerApproved(peer.clone()));
        Ok(peer)
    }

    pub(crate) async fn ensure_approved(&self, key: PeerKey) -> Option<PeerHandle> {
        self.inner.peers.write().await.ensure_approved(key)
    }

    pub async fn set_name(&self, key: PeerKey, name: &str) -> Result<PeerHandle> {
        self.inner.peers.write().await.set_name(key, name)
    }

    pub async fn set_port(&self, key: PeerKey, port: u16) -> Result<PeerHandle> {
        self.inner.peers.write().await.set_port(key, port)
    }

    /// Send to every Approved peer with a live connection. A failed or
    /// stalled peer is dropped and reported; the rest still receive the
    /// message. Returns the number of successful sends.
    pub async fn broadcast(&self, data: &[u8]) -> usize {
        let plan = self.delivery_plan().await;
        self.send_direct(plan.direct, data).await
    }

    pub(crate) async fn delivery_plan(&self) -> DeliveryPlan {
        self.inner.peers.read().await.delivery_plan()
    }

    /// One write task per peer, so a slow socket only delays itself.
    pub(crate) async fn send_direct(
        &self,
        targets: Vec<(PeerHandle, Arc<Link>)>,
        data: &[u8],
    ) -> usize {
        let data: Arc<[u8]> = Arc::from(data);
        let mut sends = JoinSet::new();
        for (peer, link) in targets {
            let data = data.clone();
            sends.spawn(async move {
                let sent = link.send(&data).await;
                (peer, link, sent)
            });
        }

        let mut delivered = 0;
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((_, _, Ok(()))) => delivered += 1,
                Ok((peer, link, Err(e))) => {
                    warn!("send to {peer} failed: {e}");
                    self.drop_link(peer.key, &link, &format!("send failed: {e}"))
                        .await;
                }
                Err(e) => warn!("send task ended abnormally: {e}"),
            }
        }
        delivered
    }

    pub(crate) async fn upsert_relay_peer(
        &self,
        id: &str,
        address: PeerAddr,
    ) -> (PeerHandle, bool) {
        self.inner.peers.write().await.upsert_relay(id, address)
    }

    pub(crate) async fn prune_relay_peers(&self, max_age: Duration) -> Vec<PeerHandle> {
        self.inner
            .peers
            .write()
            .await
            .prune_relay_only(max_age, Instant::now())
    }

    pub async fn peer(&self, key: PeerKey) -> Option<PeerHandle> {
        self.inner.peers.read().await.get(key).cloned()
    }

    pub async fn peer_by_id(&self, id: &str) -> Option<PeerHandle> {
        self.inner.peers.read().await.get_by_id(id).cloned()
    }

    pub async fn peers(&self) -> Vec<PeerHandle> {
        self.inner.peers.read().await.all()
    }

    pub async fn pending(&self) -> Vec<PeerHandle> {
        self.inner.peers.read().await.pending()
    }

    pub async fn approved(&self) -> Vec<PeerHandle> {
        self.inner.peers.read().await.approved()
    }

    pub async fn relay_peers(&self) -> Vec<PeerHandle> {
        self.inner.peers.read().await.relay_known()
    }

    /// Close every connection and stop accepting. Safe to call repeatedly
    /// and from any task.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        let links = self.inner.peers.write().await.drain();
        for link in links {
            link.close().await;
        }
        info!("overlay shut down");
        self.emit(NetEvent::NetworkShutdown);
    }
}
