//! Per-peer tracking
//!
//! Each live connection gets its own record: when it connected, when it
//! was last heard from, whether it has registered, and how many captures it
//! has had accepted.

use crate::protocol::Role;
use crate::transport::ConnectionHandle;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct PeerRecord {
    handle: ConnectionHandle,
    role: Option<Role>,
    connected_at: Instant,
    last_seen: Instant,
    captures: u64,
}

/// Snapshot of one peer for diagnostics
#[derive(Debug, Clone)]
pub struct PeerSummary {
    pub handle: ConnectionHandle,
    /// Role declared in the peer's `register`, if received yet
    pub role: Option<Role>,
    pub connected_for: Duration,
    pub last_seen_ago: Duration,
    pub captures: u64,
}

impl PeerSummary {
    pub fn is_registered(&self) -> bool {
        self.role.is_some()
    }
}

/// Live peers keyed by connection id
#[derive(Debug, Default)]
pub struct PeerTracker {
    peers: RwLock<HashMap<u64, PeerRecord>>,
}

impl PeerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly opened connection. Re-adding a known handle keeps its
    /// existing record.
    pub fn add(&self, handle: &ConnectionHandle) {
        let now = Instant::now();
        self.peers
            .write()
            .entry(handle.id)
            .or_insert_with(|| PeerRecord {
                handle: handle.clone(),
                role: None,
                connected_at: now,
                last_seen: now,
                captures: 0,
            });
    }

    /// Mark a peer registered. Returns true on the first registration.
    pub fn register(&self, handle: &ConnectionHandle, role: Role) -> bool {
        self.add(handle);
        let mut peers = self.peers.write();
        match peers.get_mut(&handle.id) {
            Some(record) => {
                record.last_seen = Instant::now();
                let first = record.role.is_none();
                record.role = Some(role);
                first
            }
            None => false,
        }
    }

    /// Refresh last-seen for any inbound traffic
    pub fn touch(&self, id: u64) {
        if let Some(record) = self.peers.write().get_mut(&id) {
            record.last_seen = Instant::now();
        }
    }

    pub fn record_capture(&self, id: u64) {
        if let Some(record) = self.peers.write().get_mut(&id) {
            record.captures += 1;
        }
    }

    pub fn remove(&self, id: u64) -> Option<ConnectionHandle> {
        self.peers.write().remove(&id).map(|record| record.handle)
    }

    pub fn contains(&self, id: u64) -> bool {
        self.peers.read().contains_key(&id)
    }

    pub fn is_registered(&self, id: u64) -> bool {
        self.peers
            .read()
            .get(&id)
            .map(|record| record.role.is_some())
            .unwrap_or(false)
    }

    /// Handles of every registered peer
    pub fn registered(&self) -> Vec<ConnectionHandle> {
        self.peers
            .read()
            .values()
            .filter(|record| record.role.is_some())
            .map(|record| record.handle.clone())
            .collect()
    }

    pub fn registered_count(&self) -> usize {
        self.peers
            .read()
            .values()
            .filter(|record| record.role.is_some())
            .count()
    }

    /// Registered peers not heard from within `timeout`
    pub fn stale(&self, timeout: Duration) -> Vec<ConnectionHandle> {
        let now = Instant::now();
        self.peers
            .read()
            .values()
            .filter(|record| {
                record.role.is_some() && now.saturating_duration_since(record.last_seen) > timeout
            })
            .map(|record| record.handle.clone())
            .collect()
    }

    /// Remove and return every peer
    pub fn drain(&self) -> Vec<ConnectionHandle> {
        self.peers
            .write()
            .drain()
            .map(|(_, record)| record.handle)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summaries(&self) -> Vec<PeerSummary> {
        let now = Instant::now();
        let mut summaries: Vec<PeerSummary> = self
            .peers
            .read()
            .values()
            .map(|record| PeerSummary {
                handle: record.handle.clone(),
                role: record.role,
                connected_for: now.saturating_duration_since(record.connected_at),
                last_seen_ago: now.saturating_duration_since(record.last_seen),
                captures: record.captures,
            })
            .collect();
        summaries.sort_by_key(|summary| summary.handle.id);
        summaries
    }
}
