//! Relay-side address cache
//!
//! Best-effort record of the addresses reserved clients published. Entries
//! expire after a TTL and the cache is capped; at capacity the stalest entry
//! is evicted. A miss means "unknown", never "unreachable".

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::trace;

use indras_core::{DialAddress, PeerId};

use crate::protocol::AddressRecord;

struct Entry {
    addresses: Vec<DialAddress>,
    inserted: Instant,
}

/// TTL-bounded map from identity to published addresses
pub struct AddressCache {
    entries: DashMap<PeerId, Entry>,
    ttl: Duration,
    capacity: usize,
}

impl AddressCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record addresses for a peer, replacing any previous record
    pub fn insert(&self, peer: PeerId, addresses: Vec<DialAddress>) {
        if addresses.is_empty() {
            self.entries.remove(&peer);
            return;
        }
        if !self.entries.contains_key(&peer) && self.entries.len() >= self.capacity {
            self.evict_one();
        }
        self.entries.insert(
            peer,
            Entry {
                addresses,
                inserted: Instant::now(),
            },
        );
    }

    /// The cached record for a peer, if present and fresh
    pub fn get(&self, peer: &PeerId) -> Option<AddressRecord> {
        let record = {
            let entry = self.entries.get(peer)?;
            let age = entry.inserted.elapsed();
            if age < self.ttl {
                Some(AddressRecord {
                    peer: *peer,
                    addresses: entry.addresses.clone(),
                    age_ms: age.as_millis() as u64,
                })
            } else {
                None
            }
        };
        if record.is_none() {
            trace!(peer = %peer.short_id(), "Dropping stale address record");
            self.entries.remove_if(peer, |_, e| e.inserted.elapsed() >= self.ttl);
        }
        record
    }

    pub fn remove(&self, peer: &PeerId) {
        self.entries.remove(peer);
    }

    /// Drop every expired record. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.inserted.elapsed() < self.ttl);
        before - self.entries.len()
    }

    fn evict_one(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.value().inserted)
            .map(|e| *e.key());
        if let Some(peer) = oldest {
            self.entries.remove(&peer);
        }
    }
}
