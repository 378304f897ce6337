//! Peer descriptors
//!
//! Descriptors hold only copyable metadata. Live connection handles are kept
//! in a separate table owned by the network, so snapshotting peers never
//! touches socket state.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;

/// Peer node information
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Peer {
    /// Remote address (dial address, or socket address for inbound peers)
    pub address: String,
    /// Public key announced in the handshake
    pub public_key: Option<String>,
    pub connected_at: DateTime<Utc>,
    /// Last time a message was decoded from this peer
    pub last_seen: DateTime<Utc>,
    /// Cleared on a write failure
    pub active: bool,
    /// True when the peer dialed us
    pub inbound: bool,
}

impl Peer {
    /// Create a new peer descriptor at connect time
    pub fn new(address: String, public_key: Option<String>, inbound: bool) -> Self {
        let now = Utc::now();
        Self {
            address,
            public_key,
            connected_at: now,
            last_seen: now,
            active: true,
            inbound,
        }
    }

    /// Refresh last-seen, never moving it backwards
    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_seen {
            self.last_seen = at;
        }
    }

    /// Check whether the peer has been silent for longer than `threshold`
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        now - self.last_seen > threshold
    }
}

/// Thread-safe peer descriptor table keyed by address
#[derive(Default)]
pub struct PeerTable {
    peers: RwLock<HashMap<String, Peer>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a peer; returns false if the address is already present
    pub fn insert(&self, peer: Peer) -> bool {
        let mut peers = self.peers.write();
        if peers.contains_key(&peer.address) {
            return false;
        }
        peers.insert(peer.address.clone(), peer);
        true
    }

    pub fn remove(&self, address: &str) -> Option<Peer> {
        self.peers.write().remove(address)
    }

    pub fn get(&self, address: &str) -> Option<Peer> {
        self.peers.read().get(address).cloned()
    }

    /// Address of the peer that announced `public_key`, if connected
    pub fn address_for_key(&self, public_key: &str) -> Option<String> {
        self.peers
            .read()
            .values()
            .find(|p| p.public_key.as_deref() == Some(public_key))
            .map(|p| p.address.clone())
    }

    pub fn touch(&self, address: &str, at: DateTime<Utc>) {
        if let Some(peer) = self.peers.write().get_mut(address) {
            peer.touch(at);
        }
    }

    pub fn mark_inactive(&self, address: &str) {
        if let Some(peer) = self.peers.write().get_mut(address) {
            if peer.active {
                tracing::debug!("Marking peer {} inactive", address);
            }
            peer.active = false;
        }
    }

    /// Remove every inactive peer and every peer silent beyond `threshold`
    pub fn remove_stale(&self, now: DateTime<Utc>, threshold: Duration) -> Vec<String> {
        let mut peers = self.peers.write();
        let stale: Vec<String> = peers
            .values()
            .filter(|p| !p.active || p.is_stale(now, threshold))
            .map(|p| p.address.clone())
            .collect();
        for address in &stale {
            peers.remove(address);
        }
        stale
    }

    /// Addresses of peers still considered writable
    pub fn active_addresses(&self) -> Vec<String> {
        self.peers
            .read()
            .values()
            .filter(|p| p.active)
            .map(|p| p.address.clone())
            .collect()
    }

    /// Copy of all descriptors, sorted by address
    pub fn snapshot(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.read().values().cloned().collect();
        peers.sort_by(|a, b| a.address.cmp(&b.address));
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.peers.read().values().filter(|p| p.active).count()
    }
}
