//! TCP front end of the relay: accept loop, per-connection reader and
//! writer tasks, and the inactivity sweep.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use p2p_proto::messages::MSG_MALFORMED_COMMAND;
use p2p_proto::wire::{decode_json, encode_json, read_frame, write_frame};
use p2p_proto::{Command, NetError, Response, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{handle_command, ConnHandle, ConnState, Outcome, RelayRegistry};

#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    pub host: String,
    pub port: u16,
    /// Registrations idle for longer than this are evicted.
    pub peer_timeout: Duration,
    pub sweep_interval: Duration,
    /// Silence after which a connection is checked for staleness; also
    /// the limit for receiving the rest of a frame once it has started.
    pub read_timeout: Duration,
    /// A client that accepts no bytes for this long is disconnected.
    pub write_timeout: Duration,
    /// Outbound frames buffered per connection before relaying to it fails.
    pub channel_capacity: usize,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 12345,
            peer_timeout: Duration::from_secs(120),
            sweep_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            channel_capacity: 256,
        }
    }
}

struct ServerInner {
    config: RelayServerConfig,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    registry: RwLock<RelayRegistry>,
    next_conn: AtomicU64,
    cancel: CancellationToken,
    shut_down: AtomicBool,
}

/// Relay server handle. Clones share the same registry.
#[derive(Clone)]
pub struct RelayServer {
    inner: Arc<ServerInner>,
}

impl RelayServer {
    /// Bind the listening socket without accepting yet.
    pub async fn bind(config: RelayServerConfig) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind((config.host.as_str(), config.port))
            .await
            .map_err(|e| NetError::Bind {
                addr: addr.clone(),
                source: e,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| NetError::Bind { addr, source: e })?;
        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                local_addr,
                listener: Mutex::new(Some(listener)),
                registry: RwLock::new(RelayRegistry::new()),
                next_conn: AtomicU64::new(1),
                cancel: CancellationToken::new(),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    /// Bind and serve on a background task.
    pub async fn start(config: RelayServerConfig) -> Result<Self> {
        let server = Self::bind(config).await?;
        let listener = server.take_listener().await?;
        let serving = server.clone();
        tokio::spawn(async move { serving.run(listener).await });
        Ok(server)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    pub async fn peer_count(&self) -> usize {
        self.inner.registry.read().await.len()
    }

    /// Accept connections until `shutdown`. Can only run once.
    pub async fn serve(&self) -> Result<()> {
        let listener = self.take_listener().await?;
        self.run(listener).await;
        Ok(())
    }

    async fn take_listener(&self) -> Result<TcpListener> {
        self.inner
            .listener
            .lock()
            .await
            .take()
            .ok_or_else(|| NetError::Protocol("relay server is already serving".into()))
    }

    async fn run(&self, listener: TcpListener) {
        info!("relay server listening on {}", self.inner.local_addr);

        let sweeper = self.clone();
        tokio::spawn(async move { sweeper.sweep_loop().await });

        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        stream.set_nodelay(true).ok();
                        let server = self.clone();
                        tokio::spawn(async move { server.handle_connection(stream, remote).await });
                    }
                    Err(e) => {
                        warn!("accept failed: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        }
        info!("relay server stopped accepting");
    }

    async fn sweep_loop(self) {
        let every = self.inner.config.sweep_interval;
        let mut tick = interval_at(Instant::now() + every, every);
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = tick.tick() => {
                    let removed = self.sweep(Instant::now()).await;
                    if removed > 0 {
                        debug!("removed {removed} expired peer registrations");
                    }
                }
            }
        }
    }

    /// Evict registrations idle past the peer timeout as of `now` and close
    /// their connections. Returns the number evicted.
    pub async fn sweep(&self, now: Instant) -> usize {
        let expired = self
            .inner
            .registry
            .write()
            .await
            .sweep(now, self.inner.config.peer_timeout);
        for entry in &expired {
            info!("evicting idle peer {}", entry.peer_id);
            entry.conn.cancel.cancel();
        }
        expired.len()
    }

    async fn handle_connection(self, stream: TcpStream, remote: SocketAddr) {
        debug!("relay connection from {remote}");
        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let (tx, rx) = mpsc::channel(self.inner.config.channel_capacity);
        let cancel = self.inner.cancel.child_token();
        let handle = ConnHandle {
            id: self.inner.next_conn.fetch_add(1, Ordering::Relaxed),
            tx: tx.clone(),
            cancel: cancel.clone(),
        };
        let conn_id = handle.id;
        let writer_task = tokio::spawn(drain_outbound(
            writer,
            rx,
            cancel.clone(),
            self.inner.config.write_timeout,
        ));
        let mut state = ConnState::new(handle);
        let read_timeout = self.inner.config.read_timeout;

        loop {
            // waiting on the buffer consumes nothing, so an idle timeout
            // never splits a frame
            let ready = tokio::select! {
                _ = cancel.cancelled() => break,
                ready = timeout(read_timeout, next_frame_started(&mut reader)) => ready,
            };
            match ready {
                Ok(Ok(true)) => {}
                Ok(Ok(false)) => {
                    debug!("connection from {remote} closed");
                    break;
                }
                Ok(Err(e)) => {
                    debug!("connection from {remote} failed: {e}");
                    break;
                }
                Err(_) => {
                    if self.is_stale(&state).await {
                        info!("closing idle connection from {remote}");
                        break;
                    }
                    continue;
                }
            }

            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = timeout(read_timeout, read_frame(&mut reader)) => frame,
            };
            let data = match frame {
                Ok(Ok(Some(data))) => data,
                Ok(Ok(None)) => {
                    debug!("connection from {remote} closed");
                    break;
                }
                Ok(Err(e)) => {
                    debug!("connection from {remote} failed: {e}");
                    break;
                }
                Err(_) => {
                    info!("closing connection from {remote}: frame stalled for {read_timeout:?}");
                    break;
                }
            };

            let outcome = match decode_json::<Command>(&data) {
                Ok(cmd) => {
                    debug!("{} from {remote}", cmd.name());
                    let mut registry = self.inner.registry.write().await;
                    handle_command(&mut registry, &mut state, cmd, Instant::now())
                }
                Err(e) => {
                    debug!("malformed command from {remote}: {e}");
                    Outcome::Reply(Response::error(MSG_MALFORMED_COMMAND))
                }
            };
            match outcome {
                Outcome::Reply(reply) => {
                    let bytes = match encode_json(&reply) {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            warn!("could not encode reply for {remote}: {e}");
                            continue;
                        }
                    };
                    if tx.send(bytes).await.is_err() {
                        break;
                    }
                }
                Outcome::Close => break,
            }
        }

        if let Some(peer_id) = state.peer_id.take() {
            if self
                .inner
                .registry
                .write()
                .await
                .remove_owned(&peer_id, conn_id)
                .is_some()
            {
                info!("peer {peer_id} left");
            }
        }
        cancel.cancel();
        writer_task.await.ok();
    }

    async fn is_stale(&self, state: &ConnState) -> bool {
        match state.peer_id.as_deref() {
            None => true,
            Some(id) => self.inner.registry.read().await.is_idle(
                id,
                Instant::now(),
                self.inner.config.read_timeout,
            ),
        }
    }

    /// Stop accepting and close every connection. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let entries = self.inner.registry.write().await.drain();
        self.inner.cancel.cancel();
        info!("relay server shut down, dropped {} registrations", entries.len());
    }
}

/// Resolves once the next frame has at least one byte buffered. `false`
/// means the client closed the stream.
async fn next_frame_started(reader: &mut BufReader<OwnedReadHalf>) -> std::io::Result<bool> {
    Ok(!reader.fill_buf().await?.is_empty())
}

/// Single writer per connection: replies and relayed pushes share one
/// ordered queue. A write that stalls past `write_timeout` cancels the
/// connection.
async fn drain_outbound(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
    write_timeout: Duration,
) {
    loop {
        let data = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(data) => data,
                None => break,
            },
        };
        let written = tokio::select! {
            _ = cancel.cancelled() => break,
            written = timeout(write_timeout, write_frame(&mut writer, &data)) => written,
        };
        match written {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("outbound write failed: {e}");
                cancel.cancel();
                break;
            }
            Err(_) => {
                debug!("outbound write stalled for {write_timeout:?}");
                cancel.cancel();
                break;
            }
        }
    }
    writer.shutdown().await.ok();
}
