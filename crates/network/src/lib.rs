//! Peer Network - best-effort gossip mesh between validators
//!
//! Architecture:
//! - An accept loop registers inbound WebSocket connections as peers
//! - Bootstrap dialers retry each configured peer until connected
//! - Every connection gets a reader task and a writer task
//! - A dispatch loop drains decoded messages and hands them to a [`GossipHandler`]
//! - A periodic sweep prunes peers that went quiet

pub mod error;
pub mod message;
pub mod network;
pub mod peer;

pub use error::{NetworkError, NetworkResult};
pub use message::{GossipMessage, MessageType};
pub use network::{GossipHandler, NetworkConfig, NetworkStats, PeerNetwork};
pub use peer::{Peer, PeerTable};

/// Handshake header carrying a node's public key in both directions
pub const IDENTITY_HEADER: &str = "x-validator-key";
