//! Peer registry
//!
//! In-memory table of peers keyed by `host:port`, updated by the accept and
//! dial loops and snapshotted by observability consumers. Records are never
//! evicted here; consumers may prune by `last_seen`.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::SystemTime;

/// Liveness and reachability state for one peer.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Peer network address (`host:port`).
    pub address: String,
    /// Last observed round-trip time in milliseconds (0 = never measured).
    pub rtt_ms: u64,
    /// Reached through a relay.
    pub relay: bool,
    /// Reached directly (successful dial).
    pub p2p: bool,
    /// Dialing stopped permanently after repeated failures.
    pub dial_stopped: bool,
    /// First time this peer was observed.
    pub created_at: SystemTime,
    /// Last observed traffic or probe.
    pub last_seen: SystemTime,
}

impl Peer {
    fn new(address: String) -> Self {
        let now = SystemTime::now();
        Self {
            address,
            rtt_ms: 0,
            relay: false,
            p2p: false,
            dial_stopped: false,
            created_at: now,
            last_seen: now,
        }
    }
}

/// Shared peer table behind a reader-writer lock.
///
/// Mutations hold the write lock only for the map update; no I/O happens
/// under the lock.
#[derive(Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<String, Peer>>,
}

impl PeerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensure a record exists and refresh its `last_seen`.
    pub fn touch(&self, addr: &str) {
        let mut peers = self.peers.write().unwrap();
        peers
            .entry(addr.to_string())
            .or_insert_with(|| Peer::new(addr.to_string()))
            .last_seen = SystemTime::now();
    }

    /// Record a measured round trip; marks the peer directly reached.
    pub fn record_rtt(&self, addr: &str, rtt_ms: u64) {
        let mut peers = self.peers.write().unwrap();
        let peer = peers
            .entry(addr.to_string())
            .or_insert_with(|| Peer::new(addr.to_string()));
        peer.rtt_ms = rtt_ms;
        peer.p2p = true;
        peer.last_seen = SystemTime::now();
    }

    /// Mark the peer's dialer as permanently stopped.
    pub fn mark_dial_stopped(&self, addr: &str) {
        let mut peers = self.peers.write().unwrap();
        peers
            .entry(addr.to_string())
            .or_insert_with(|| Peer::new(addr.to_string()))
            .dial_stopped = true;
    }

    /// Shallow copy of all records.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.peers.read().unwrap().values().cloned().collect()
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.peers.read().unwrap().len()
    }

    /// True when no peer has been observed yet.
    pub fn is_empty(&self) -> bool {
        self.peers.read().unwrap().is_empty()
    }
}
