//! Relay server: a rendezvous registry plus message forwarding for peers
//! that cannot reach each other directly.
//!
//! Every connection speaks length-prefixed JSON commands (see
//! `p2p_proto::messages`). Registrations expire after a period of silence.

pub mod registry;
pub mod server;

pub use registry::{handle_command, ConnHandle, ConnState, Outcome, RegistryEntry, RelayRegistry};
pub use server::{RelayServer, RelayServerConfig};
