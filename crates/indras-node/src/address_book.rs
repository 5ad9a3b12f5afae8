//! Short-lived per-peer address book
//!
//! Holds the addresses the dial coordinator has heard of or reached for a
//! peer. Entries expire after a TTL; nothing here outlives the process.
//! Success and failure counts feed candidate ranking. A failure only lowers
//! an address's rank, while an identity mismatch evicts it.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::trace;

use indras_core::{DialAddress, PeerId};

/// How much an address has been confirmed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trust {
    /// Heard of from a directory or relay cache
    Unverified,
    /// Completed the transport and security handshake as the expected peer
    Verified,
}

/// What the book knows about one address
#[derive(Debug, Clone)]
pub struct BookEntry {
    pub address: DialAddress,
    pub trust: Trust,
    pub successes: u32,
    pub failures: u32,
    pub last_verified: Option<DateTime<Utc>>,
    refreshed: Instant,
}

impl BookEntry {
    fn new(address: DialAddress) -> Self {
        Self {
            address,
            trust: Trust::Unverified,
            successes: 0,
            failures: 0,
            last_verified: None,
            refreshed: Instant::now(),
        }
    }

    /// Smoothed success rate; an untried address scores 0.5
    pub fn success_rate(&self) -> f64 {
        (self.successes as f64 + 1.0) / (self.successes as f64 + self.failures as f64 + 2.0)
    }
}

/// TTL-bounded map from identity to known addresses
pub struct AddressBook {
    entries: DashMap<PeerId, Vec<BookEntry>>,
    ttl: Duration,
    per_peer: usize,
}

impl AddressBook {
    pub fn new(ttl: Duration, per_peer: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            per_peer: per_peer.max(1),
        }
    }

    /// Peers with at least one entry
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record addresses heard of for a peer, refreshing known ones
    pub fn insert_unverified(&self, peer: PeerId, addresses: &[DialAddress]) {
        if addresses.is_empty() {
            return;
        }
        let mut entries = self.entries.entry(peer).or_default();
        for address in addresses {
            match entries.iter_mut().find(|e| &e.address == address) {
                Some(entry) => entry.refreshed = Instant::now(),
                None => entries.push(BookEntry::new(address.clone())),
            }
        }
        if entries.len() > self.per_peer {
            // Keep the best-performing addresses
            entries.sort_by(|a, b| b.success_rate().total_cmp(&a.success_rate()));
            entries.truncate(self.per_peer);
        }
    }

    /// The address completed a dial as `peer`
    pub fn record_success(&self, peer: PeerId, address: &DialAddress) {
        let mut entries = self.entries.entry(peer).or_default();
        let index = match entries.iter().position(|e| &e.address == address) {
            Some(i) => i,
            None => {
                entries.push(BookEntry::new(address.clone()));
                entries.len() - 1
            }
        };
        let entry = &mut entries[index];
        entry.trust = Trust::Verified;
        entry.successes = entry.successes.saturating_add(1);
        entry.last_verified = Some(Utc::now());
        entry.refreshed = Instant::now();
    }

    /// The address failed to dial
    pub fn record_failure(&self, peer: &PeerId, address: &DialAddress) {
        if let Some(mut entries) = self.entries.get_mut(peer) {
            if let Some(entry) = entries.iter_mut().find(|e| &e.address == address) {
                entry.failures = entry.failures.saturating_add(1);
            }
        }
    }

    /// Forget an address for a peer
    pub fn evict(&self, peer: &PeerId, address: &DialAddress) {
        if let Some(mut entries) = self.entries.get_mut(peer) {
            entries.retain(|e| &e.address != address);
        }
        self.entries.remove_if(peer, |_, entries| entries.is_empty());
    }

    /// Fresh entries for a peer
    pub fn entries(&self, peer: &PeerId) -> Vec<BookEntry> {
        let fresh: Vec<BookEntry> = match self.entries.get(peer) {
            Some(entries) => entries
                .iter()
                .filter(|e| e.refreshed.elapsed() < self.ttl)
                .cloned()
                .collect(),
            None => return Vec::new(),
        };
        if self
            .entries
            .get(peer)
            .is_some_and(|entries| entries.len() != fresh.len())
        {
            trace!(peer = %peer.short_id(), "Dropping expired addresses");
            self.prune_peer(peer);
        }
        fresh
    }

    pub fn addresses(&self, peer: &PeerId) -> Vec<DialAddress> {
        self.entries(peer).into_iter().map(|e| e.address).collect()
    }

    pub fn entry(&self, peer: &PeerId, address: &DialAddress) -> Option<BookEntry> {
        self.entries(peer).into_iter().find(|e| &e.address == address)
    }

    /// Ranking input for an address; untried addresses score 0.5
    pub fn success_rate(&self, peer: &PeerId, address: &DialAddress) -> f64 {
        self.entry(peer, address)
            .map(|e| e.success_rate())
            .unwrap_or(0.5)
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|e| e.refreshed.elapsed() < self.ttl);
            removed += before - entries.len();
            !entries.is_empty()
        });
        removed
    }

    fn prune_peer(&self, peer: &PeerId) {
        if let Some(mut entries) = self.entries.get_mut(peer) {
            entries.retain(|e| e.refreshed.elapsed() < self.ttl);
        }
        self.entries.remove_if(peer, |_, entries| entries.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(b: u8) -> PeerId {
        PeerId::from_bytes([b; 32])
    }

    #[test]
    fn test_success_marks_verified() {
        let book = AddressBook::new(Duration::from_secs(60), 8);
        let addr = DialAddress::memory(1);
        book.insert_unverified(peer(1), &[addr.clone()]);
        assert_eq!(book.entry(&peer(1), &addr).unwrap().trust, Trust::Unverified);

        book.record_success(peer(1), &addr);
        let entry = book.entry(&peer(1), &addr).unwrap();
        assert_eq!(entry.trust, Trust::Verified);
        assert_eq!(entry.successes, 1);
        assert!(entry.last_verified.is_some());
        assert!(book.success_rate(&peer(1), &addr) > 0.5);
    }

    #[test]
    fn test_failure_lowers_rate_but_keeps_address() {
        let book = AddressBook::new(Duration::from_secs(60), 8);
        let addr = DialAddress::memory(1);
        book.insert_unverified(peer(1), &[addr.clone()]);
        book.record_failure(&peer(1), &addr);
        book.record_failure(&peer(1), &addr);

        assert!(book.success_rate(&peer(1), &addr) < 0.5);
        assert_eq!(book.addresses(&peer(1)), vec![addr]);
    }

    #[test]
    fn test_evict() {
        let book = AddressBook::new(Duration::from_secs(60), 8);
        let addr = DialAddress::memory(1);
        book.insert_unverified(peer(1), &[addr.clone()]);
        book.evict(&peer(1), &addr);
        assert!(book.addresses(&peer(1)).is_empty());
        assert!(book.is_empty());
    }

    #[test]
    fn test_entries_expire() {
        let book = AddressBook::new(Duration::from_millis(10), 8);
        book.insert_unverified(peer(1), &[DialAddress::memory(1)]);
        std::thread::sleep(Duration::from_millis(20));
        assert!(book.addresses(&peer(1)).is_empty());
        assert!(book.is_empty());
    }

    #[test]
    fn test_per_peer_cap_keeps_best() {
        let book = AddressBook::new(Duration::from_secs(60), 2);
        let good = DialAddress::memory(1);
        book.record_success(peer(1), &good);
        book.insert_unverified(peer(1), &[DialAddress::memory(2), DialAddress::memory(3)]);

        let addrs = book.addresses(&peer(1));
        assert_eq!(addrs.len(), 2);
        assert!(addrs.contains(&good));
    }

    #[test]
    fn test_prune() {
        let book = AddressBook::new(Duration::from_millis(5), 8);
        book.insert_unverified(peer(1), &[DialAddress::memory(1)]);
        std::thread::sleep(Duration::from_millis(10));
        book.insert_unverified(peer(2), &[DialAddress::memory(2)]);
        assert_eq!(book.prune(), 1);
        assert_eq!(book.len(), 1);
    }
}
