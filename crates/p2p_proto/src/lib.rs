//! Shared protocol types for peers and the relay server.

pub mod error;
pub mod messages;
pub mod wire;

pub use error::{NetError, Result};
pub use messages::{
    Command, FileTransfer, PeerInfo, Relayed, RelayContent, Response, ServerMessage, Status,
    TypedContent,
};
