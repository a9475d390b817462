//! Error taxonomy shared by the overlay, the relay client and the relay server.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    /// Listening address could not be bound (usually already in use).
    #[error("bind {addr} failed: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    /// Peer or relay unreachable. Recoverable; the caller may retry.
    #[error("connect to {addr} failed: {reason}")]
    Connect { addr: String, reason: String },
    /// Malformed or unexpected message on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// An established connection dropped.
    #[error("transport lost: {0}")]
    TransportLost(String),
    /// The relay server rejected a command, e.g. an unknown peer id.
    #[error("relay error: {0}")]
    Registry(String),
    #[error("unknown peer: {0}")]
    UnknownPeer(String),
    #[error("peer {0} is not awaiting approval")]
    NotPending(String),
    #[error("not connected to relay")]
    NotConnected,
}

impl NetError {
    pub fn connect(addr: impl Into<String>, reason: impl ToString) -> Self {
        Self::Connect {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for NetError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(format!("json: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, NetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let e = NetError::connect("10.0.0.1:12345", "connection refused");
        assert_eq!(
            e.to_string(),
            "connect to 10.0.0.1:12345 failed: connection refused"
        );

        let e = NetError::Registry("Peer not registered".into());
        assert_eq!(e.to_string(), "relay error: Peer not registered");
    }

    #[test]
    fn json_errors_become_protocol_errors() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        assert!(matches!(NetError::from(err), NetError::Protocol(_)));
    }
}
