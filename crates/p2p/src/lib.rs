//! The peer-to-peer overlay: websocket transport, typed JSON messages,
//! per-peer dedup on broadcast, peer discovery, and block recovery.

pub mod discovery;
pub mod errors;
pub mod message;
pub mod recovery;
pub mod registry;
pub mod sent_set;
pub mod transport;

pub use errors::P2pError;
pub use message::{Handshake, MessageType, WireMessage};
pub use recovery::RecoveryEngine;
pub use registry::{PeerId, PeerRegistry};
