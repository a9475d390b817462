//! Peer identity: admission state, transport mode and address.

use std::net::SocketAddr;

use tokio::time::Instant;

/// Process-local key of a peer slot. Stable for the slot's lifetime.
pub type PeerKey = u64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl std::fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Unconfirmed,
    Approved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    Direct,
    RelayOnly,
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "direct connection"),
            Self::RelayOnly => write!(f, "relay only"),
        }
    }
}

/// Snapshot of one remote party. The live connection itself stays in the
/// peer table; handles are cheap to clone and hand to observers.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub key: PeerKey,
    /// Relay-assigned id. `None` for peers only known by a direct socket.
    pub id: Option<String>,
    pub address: PeerAddr,
    pub display_name: Option<String>,
    pub admission: Admission,
    pub transport: TransportMode,
    pub last_seen: Instant,
}

impl PeerHandle {
    pub(crate) fn new(
        key: PeerKey,
        id: Option<String>,
        address: PeerAddr,
        admission: Admission,
        transport: TransportMode,
    ) -> Self {
        Self {
            key,
            id,
            address,
            display_name: None,
            admission,
            transport,
            last_seen: Instant::now(),
        }
    }

    pub fn is_approved(&self) -> bool {
        self.admission == Admission::Approved
    }

    pub fn is_direct(&self) -> bool {
        self.transport == TransportMode::Direct
    }

    pub fn is_relay_only(&self) -> bool {
        self.transport == TransportMode::RelayOnly
    }

    pub fn mark_seen(&mut self) {
        self.last_seen = Instant::now();
    }
}

impl std::fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(name) = &self.display_name {
            return write!(f, "{name} ({})", self.address);
        }
        match &self.id {
            Some(id) => {
                let short: String = id.chars().take(8).collect();
                write!(f, "{} [{short}]", self.address)
            }
            None => write!(f, "{}", self.address),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefers_name_then_short_id() {
        let mut peer = PeerHandle::new(
            1,
            Some("0123456789abcdef".into()),
            PeerAddr::new("10.0.0.4", 9000),
            Admission::Unconfirmed,
            TransportMode::RelayOnly,
        );
        assert_eq!(peer.to_string(), "10.0.0.4:9000 [01234567]");

        peer.display_name = Some("alice".into());
        assert_eq!(peer.to_string(), "alice (10.0.0.4:9000)");

        let direct = PeerHandle::new(
            2,
            None,
            PeerAddr::new("10.0.0.5", 12345),
            Admission::Approved,
            TransportMode::Direct,
        );
        assert_eq!(direct.to_string(), "10.0.0.5:12345");
    }

    #[test]
    fn state_predicates() {
        let peer = PeerHandle::new(
            3,
            None,
            PeerAddr::from("127.0.0.1:4000".parse::<SocketAddr>().unwrap()),
            Admission::Approved,
            TransportMode::Direct,
        );
        assert!(peer.is_approved());
        assert!(peer.is_direct());
        assert!(!peer.is_relay_only());
        assert_eq!(peer.address, PeerAddr::new("127.0.0.1", 4000));
    }

    #[test]
    fn display_modes() {
        assert_eq!(format!("{}", TransportMode::Direct), "direct connection");
        assert_eq!(format!("{}", TransportMode::RelayOnly), "relay only");
    }
}
