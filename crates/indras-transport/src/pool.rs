//! Connection pool: verified identity to live connections
//!
//! Backed by a [`DashMap`], so lookups and enumeration proceed concurrently
//! while inserts and removals for the same peer are serialized. Callers get
//! cloned handles and never hold a shard guard across an await.
//!
//! The total is kept in an atomic counter: an insert reserves its place
//! before touching the map, so concurrent inserts never overshoot the limit.

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use tracing::warn;

use indras_core::{ConnectionId, ConnectionRole, PathKind, PeerId};

use crate::connection::Connection;
use crate::error::ConnectionError;

/// Live connections keyed by remote identity
pub struct ConnectionPool {
    connections: DashMap<PeerId, Vec<Connection>>,
    count: AtomicUsize,
    max_connections: usize,
}

impl ConnectionPool {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: DashMap::new(),
            count: AtomicUsize::new(0),
            max_connections,
        }
    }

    /// Total connections across all peers
    pub fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Add a connection, failing fast at the pool ceiling
    pub fn insert(&self, conn: Connection) -> Result<(), ConnectionError> {
        let max = self.max_connections;
        let reserved = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < max).then_some(n + 1)
            });
        if let Err(current) = reserved {
            warn!(current, max, "Connection limit reached");
            return Err(ConnectionError::TooManyConnections { current, max });
        }
        self.connections
            .entry(conn.remote_peer())
            .or_default()
            .push(conn);
        Ok(())
    }

    /// Remove a connection by id. Returns it if it was present.
    pub fn remove(&self, peer: &PeerId, id: ConnectionId) -> Option<Connection> {
        let mut removed = None;
        if let Some(mut conns) = self.connections.get_mut(peer) {
            if let Some(pos) = conns.iter().position(|c| c.id() == id) {
                removed = Some(conns.remove(pos));
                self.count.fetch_sub(1, Ordering::SeqCst);
            }
        }
        self.connections.remove_if(peer, |_, conns| conns.is_empty());
        removed
    }

    pub fn contains(&self, conn: &Connection) -> bool {
        self.connections
            .get(&conn.remote_peer())
            .map(|conns| conns.iter().any(|c| c == conn))
            .unwrap_or(false)
    }

    /// All connections to a peer, primaries first
    pub fn get(&self, peer: &PeerId) -> Vec<Connection> {
        let mut conns = self
            .connections
            .get(peer)
            .map(|conns| conns.clone())
            .unwrap_or_default();
        conns.sort_by_key(|c| (c.role() == ConnectionRole::Backup, c.id()));
        conns
    }

    /// The connection callers should use for a peer
    ///
    /// Prefers a healthy direct primary, then any healthy primary.
    pub fn primary(&self, peer: &PeerId) -> Option<Connection> {
        let conns = self.connections.get(peer)?;
        let mut healthy = conns
            .iter()
            .filter(|c| c.role() == ConnectionRole::Primary && c.is_healthy());
        let first = healthy.next()?.clone();
        if first.path_kind() == PathKind::Direct {
            return Some(first);
        }
        Some(
            healthy
                .find(|c| c.path_kind() == PathKind::Direct)
                .cloned()
                .unwrap_or(first),
        )
    }

    /// A retained relayed backup for a peer
    pub fn backup(&self, peer: &PeerId) -> Option<Connection> {
        self.connections.get(peer).and_then(|conns| {
            conns
                .iter()
                .find(|c| c.role() == ConnectionRole::Backup && c.is_healthy())
                .cloned()
        })
    }

    pub fn all(&self) -> Vec<Connection> {
        self.connections
            .iter()
            .flat_map(|e| e.value().clone())
            .collect()
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.connections.iter().map(|e| *e.key()).collect()
    }
}
