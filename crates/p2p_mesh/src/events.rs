//! Events surfaced to observers (the CLI or any other front end).

use std::borrow::Cow;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::warn;

use crate::peer::{PeerAddr, PeerHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Raw frame from a direct connection.
    Bytes(Vec<u8>),
    /// Text relayed through the relay server.
    Text(String),
    /// Human-readable status or failure report.
    Status(String),
    /// File delivered through the relay, already decoded.
    File { filename: String, data: Vec<u8> },
}

/// One inbound message or status report. Fields are read-only once built.
#[derive(Debug, Clone)]
pub struct Envelope {
    payload: Payload,
    origin: Option<PeerHandle>,
}

impl Envelope {
    pub fn status(text: impl Into<String>) -> Self {
        Self {
            payload: Payload::Status(text.into()),
            origin: None,
        }
    }

    pub fn from_peer(payload: Payload, origin: PeerHandle) -> Self {
        Self {
            payload,
            origin: Some(origin),
        }
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn origin(&self) -> Option<&PeerHandle> {
        self.origin.as_ref()
    }

    /// Printable form of the payload; files render as their name.
    pub fn text(&self) -> Cow<'_, str> {
        match &self.payload {
            Payload::Bytes(b) => String::from_utf8_lossy(b),
            Payload::Text(s) | Payload::Status(s) => Cow::Borrowed(s),
            Payload::File { filename, data } => {
                Cow::Owned(format!("<file {filename}, {} bytes>", data.len()))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum NetEvent {
    Message(Envelope),
    /// Inbound connection waiting for approval.
    PeerPending(PeerHandle),
    /// Outbound or upgraded direct connection established.
    PeerConnected(PeerHandle),
    PeerApproved(PeerHandle),
    PeerLost { peer: PeerHandle, reason: String },
    RelayConnected { peer_id: String, relay: PeerAddr },
    RelayLost { reason: String },
    NetworkShutdown,
}

impl NetEvent {
    pub fn status(text: impl Into<String>) -> Self {
        Self::Message(Envelope::status(text))
    }
}

pub type EventHandler = Arc<dyn Fn(&NetEvent) + Send + Sync>;

/// Registered observers. Handlers run on the emitting task, so events
/// from one connection reach them in arrival order.
#[derive(Clone, Default)]
pub struct Observers {
    handlers: Arc<RwLock<Vec<EventHandler>>>,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handler: EventHandler) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handler);
    }

    /// Channel-backed observer, convenient for async consumers.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<NetEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.register(Arc::new(move |event: &NetEvent| {
            tx.send(event.clone()).ok();
        }));
        rx
    }

    pub fn emit(&self, event: NetEvent) {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                warn!("event observer panicked; continuing");
            }
        }
    }
}
