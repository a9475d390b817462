//! JSON messages exchanged on the peer <-> relay control channel.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{NetError, Result};

pub const MSG_NOT_REGISTERED: &str = "Peer not registered";
pub const MSG_INVALID_PEER_IDS: &str = "Invalid peer IDs";
pub const MSG_UNKNOWN_COMMAND: &str = "Unknown command";
pub const MSG_MALFORMED_COMMAND: &str = "Malformed command";

/// Client -> server commands, tagged by the `command` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Register {
        ip: String,
        port: u16,
    },
    Heartbeat {
        peer_id: String,
    },
    GetPeers {
        peer_id: String,
    },
    RelayMessage {
        peer_id: String,
        target_id: String,
        content: RelayContent,
    },
    Disconnect {
        peer_id: String,
    },
    #[serde(other)]
    Unknown,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::Heartbeat { .. } => "heartbeat",
            Self::GetPeers { .. } => "get_peers",
            Self::RelayMessage { .. } => "relay_message",
            Self::Disconnect { .. } => "disconnect",
            Self::Unknown => "unknown",
        }
    }
}

/// Payload carried by `relay_message` and the matching `relayed` push:
/// either plain text or a typed object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelayContent {
    Text(String),
    Typed(TypedContent),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TypedContent {
    FileTransfer(FileTransfer),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTransfer {
    pub filename: String,
    /// Base64 (standard alphabet, padded).
    pub data: String,
}

impl FileTransfer {
    pub fn new(filename: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            filename: filename.into(),
            data: STANDARD.encode(bytes),
        }
    }

    pub fn decode(&self) -> Result<Vec<u8>> {
        STANDARD
            .decode(&self.data)
            .map_err(|e| NetError::Protocol(format!("file {}: bad base64: {e}", self.filename)))
    }
}

impl RelayContent {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    pub fn file(filename: impl Into<String>, bytes: &[u8]) -> Self {
        Self::Typed(TypedContent::FileTransfer(FileTransfer::new(filename, bytes)))
    }
}

impl From<&str> for RelayContent {
    fn from(s: &str) -> Self {
        Self::text(s)
    }
}

impl From<String> for RelayContent {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<FileTransfer> for RelayContent {
    fn from(file: FileTransfer) -> Self {
        Self::Typed(TypedContent::FileTransfer(file))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

/// One entry of a `get_peers` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub peer_id: String,
    pub ip: String,
    pub port: u16,
}

/// Server -> client reply to a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peers: Option<Vec<PeerInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Response {
    pub fn success() -> Self {
        Self {
            status: Status::Success,
            peer_id: None,
            peers: None,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: Some(message.into()),
            ..Self::success()
        }
    }

    pub fn registered(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: Some(peer_id.into()),
            ..Self::success()
        }
    }

    pub fn peer_list(peers: Vec<PeerInfo>) -> Self {
        Self {
            peers: Some(peers),
            ..Self::success()
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    /// Convert an error reply into `NetError::Registry`.
    pub fn into_result(self) -> Result<Self> {
        match self.status {
            Status::Success => Ok(self),
            Status::Error => Err(NetError::Registry(
                self.message.unwrap_or_else(|| "unspecified error".into()),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushKind {
    Relayed,
}

/// Server -> client push carrying a message from another peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relayed {
    #[serde(rename = "type")]
    pub kind: PushKind,
    pub sender_id: String,
    pub sender_ip: String,
    pub sender_port: u16,
    pub content: RelayContent,
}

impl Relayed {
    pub fn new(sender_id: &str, sender_ip: &str, sender_port: u16, content: RelayContent) -> Self {
        Self {
            kind: PushKind::Relayed,
            sender_id: sender_id.to_string(),
            sender_ip: sender_ip.to_string(),
            sender_port,
            content,
        }
    }
}

/// Anything the server may write on a control connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Relayed(Relayed),
    Response(Response),
}
