//! Peer-to-peer connection layer: peer lifecycle, direct sockets, message
//! fan-out and relay-assisted delivery.
//!
//! `DirectOverlay` owns every direct connection. `RelayClient` wraps an
//! overlay and adds a relay server for peers that cannot be reached directly.

pub mod events;
pub mod overlay;
pub mod peer;
pub mod peer_table;
pub mod relay_client;

pub use events::{Envelope, EventHandler, NetEvent, Observers, Payload};
pub use overlay::{DirectOverlay, OverlayConfig};
pub use peer::{Admission, PeerAddr, PeerHandle, PeerKey, TransportMode};
pub use peer_table::PeerTable;
pub use relay_client::{
    RegistrationResult, RelayClient, RelayClientConfig, RelayStatus, BINARY_PAYLOAD_NAME,
};
