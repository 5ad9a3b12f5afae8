//! In-process implementations of the external collaborators
//!
//! [`MemoryNetwork`] routes dials between [`MemoryTransport`]s through
//! `tokio::io::duplex` pipes. It models just enough of the real world to
//! exercise the connectivity core:
//!
//! - listeners behind an endpoint-independent NAT only admit inbound dials
//!   from peers they recently dialed themselves (a "pinhole")
//! - listeners behind a symmetric NAT admit no unsolicited inbound dials
//! - per-port faults: refused, black-holed, delayed, or answering with a
//!   different identity than the one the address names
//!
//! [`StaticDirectory`] and [`StaticNat`] stand in for discovery and NAT
//! classification.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::address::DialAddress;
use crate::error::TransportError;
use crate::identity::PeerId;
use crate::nat::NatType;
use crate::transport::{AddressDirectory, Listener, NatDetector, RawConnection, Transport};

const DUPLEX_BUFFER: usize = 64 * 1024;
const LISTENER_BACKLOG: usize = 64;
const EPHEMERAL_PORT_BASE: u64 = 40_000;

/// How a peer's NAT treats unsolicited inbound dials
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NatBehavior {
    /// Publicly reachable
    #[default]
    Open,
    /// Admits a peer only after dialing it first
    EndpointIndependent,
    /// Admits nothing unsolicited, pinholes included
    Symmetric,
}

impl NatBehavior {
    /// Classification a NAT detector would report for this behaviour
    pub fn nat_type(&self) -> NatType {
        match self {
            NatBehavior::Open => NatType::Public,
            NatBehavior::EndpointIndependent => NatType::EndpointIndependent,
            NatBehavior::Symmetric => NatType::AddressDependent,
        }
    }
}

/// Fault injected on a listen port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail immediately with [`TransportError::Unreachable`]
    Unreachable,
    /// Never answer; the dial runs until its deadline
    Blackhole,
    /// Delay the handshake
    Latency(Duration),
    /// Complete the handshake as a different identity
    Impersonate(PeerId),
}

struct ListenerEntry {
    peer: PeerId,
    nat: NatBehavior,
    tx: mpsc::Sender<RawConnection>,
}

struct Inner {
    listeners: DashMap<u64, ListenerEntry>,
    /// (inside, outside) -> time the inside peer last dialed the outside peer
    pinholes: DashMap<(PeerId, PeerId), Instant>,
    faults: DashMap<u64, Fault>,
    dial_counts: DashMap<u64, usize>,
    pending_dials: AtomicUsize,
    next_port: AtomicU64,
    pinhole_ttl: Duration,
}

/// Shared in-memory network fabric
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<Inner>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::with_pinhole_ttl(Duration::from_secs(30))
    }

    pub fn with_pinhole_ttl(pinhole_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                listeners: DashMap::new(),
                pinholes: DashMap::new(),
                faults: DashMap::new(),
                dial_counts: DashMap::new(),
                pending_dials: AtomicUsize::new(0),
                next_port: AtomicU64::new(EPHEMERAL_PORT_BASE),
                pinhole_ttl,
            }),
        }
    }

    /// Create a transport for `peer` on this network
    pub fn transport(&self, peer: PeerId, nat: NatBehavior) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            local_peer: peer,
            nat,
        }
    }

    pub fn inject_fault(&self, port: u64, fault: Fault) {
        self.inner.faults.insert(port, fault);
    }

    pub fn clear_fault(&self, port: u64) {
        self.inner.faults.remove(&port);
    }

    /// Tear down a listener as if its host vanished
    pub fn close_listener(&self, port: u64) {
        self.inner.listeners.remove(&port);
    }

    /// Number of dials made to a port so far
    pub fn dial_count(&self, port: u64) -> usize {
        self.inner.dial_counts.get(&port).map(|c| *c).unwrap_or(0)
    }

    /// Dials currently in flight on this network
    pub fn pending_dials(&self) -> usize {
        self.inner.pending_dials.load(Ordering::SeqCst)
    }

    fn allocate_port(&self) -> u64 {
        self.inner.next_port.fetch_add(1, Ordering::Relaxed)
    }

    fn open_pinhole(&self, inside: PeerId, outside: PeerId) {
        self.inner.pinholes.insert((inside, outside), Instant::now());
    }

    fn has_pinhole(&self, inside: PeerId, outside: PeerId) -> bool {
        self.inner
            .pinholes
            .get(&(inside, outside))
            .map(|at| at.elapsed() <= self.inner.pinhole_ttl)
            .unwrap_or(false)
    }
}

struct PendingDial<'a>(&'a AtomicUsize);

impl<'a> PendingDial<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PendingDial<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A peer's attachment to a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local_peer: PeerId,
    nat: NatBehavior,
}

impl MemoryTransport {
    pub fn network(&self) -> &MemoryNetwork {
        &self.network
    }

    pub fn nat(&self) -> NatBehavior {
        self.nat
    }

    async fn dial_inner(
        &self,
        addr: &DialAddress,
        port: u64,
        deadline: Instant,
    ) -> Result<RawConnection, TransportError> {
        let fault = self.network.inner.faults.get(&port).map(|f| *f);

        // Outbound traffic opens our side of the mapping whatever happens next
        let listener_peer = self
            .network
            .inner
            .listeners
            .get(&port)
            .map(|entry| entry.peer);
        if let Some(peer) = listener_peer.or(addr.peer_id()) {
            self.network.open_pinhole(self.local_peer, peer);
        }

        match fault {
            Some(Fault::Unreachable) => {
                return Err(TransportError::Unreachable(addr.to_string()));
            }
            Some(Fault::Blackhole) => {
                tokio::time::sleep_until(deadline).await;
                return Err(TransportError::Timeout);
            }
            Some(Fault::Latency(delay)) => tokio::time::sleep(delay).await,
            _ => {}
        }

        let (listener_peer, nat, tx) = {
            let entry = self
                .network
                .inner
                .listeners
                .get(&port)
                .ok_or_else(|| TransportError::ConnectionRefused(addr.to_string()))?;
            (entry.peer, entry.nat, entry.tx.clone())
        };

        let admitted = match nat {
            NatBehavior::Open => true,
            NatBehavior::EndpointIndependent => {
                self.network.has_pinhole(listener_peer, self.local_peer)
            }
            NatBehavior::Symmetric => false,
        };
        if !admitted {
            trace!(port, "Inbound dial filtered by NAT");
            return Err(TransportError::Unreachable(format!(
                "{addr} (filtered by NAT)"
            )));
        }

        let verified = match fault {
            Some(Fault::Impersonate(other)) => other,
            _ => listener_peer,
        };

        let local_addr = DialAddress::memory(self.network.allocate_port());
        let remote_addr = addr.without_peer();
        let (ours, theirs) = tokio::io::duplex(DUPLEX_BUFFER);

        tx.send(RawConnection {
            io: Box::new(theirs),
            remote_peer: self.local_peer,
            local_addr: remote_addr.clone(),
            remote_addr: local_addr.clone(),
        })
        .await
        .map_err(|_| TransportError::ConnectionRefused(addr.to_string()))?;

        debug!(
            peer = %verified.short_id(),
            addr = %addr,
            "Memory dial connected"
        );

        Ok(RawConnection {
            io: Box::new(ours),
            remote_peer: verified,
            local_addr,
            remote_addr,
        })
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    fn supports(&self, addr: &DialAddress) -> bool {
        !addr.is_relayed() && addr.memory_port().is_some()
    }

    async fn dial(
        &self,
        addr: &DialAddress,
        deadline: Instant,
    ) -> Result<RawConnection, TransportError> {
        let port = match addr.memory_port() {
            Some(port) if !addr.is_relayed() => port,
            _ => return Err(TransportError::Unsupported(addr.to_string())),
        };

        let _pending = PendingDial::enter(&self.network.inner.pending_dials);
        *self.network.inner.dial_counts.entry(port).or_insert(0) += 1;

        tokio::time::timeout_at(deadline, self.dial_inner(addr, port, deadline))
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    async fn listen(&self, addr: &DialAddress) -> Result<Listener, TransportError> {
        let port = match addr.memory_port() {
            Some(0) => self.network.allocate_port(),
            Some(port) => port,
            None => return Err(TransportError::Unsupported(addr.to_string())),
        };

        let (tx, rx) = mpsc::channel(LISTENER_BACKLOG);
        match self.network.inner.listeners.entry(port) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(TransportError::AddressInUse(addr.to_string()));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(ListenerEntry {
                    peer: self.local_peer,
                    nat: self.nat,
                    tx,
                });
            }
        }

        let local_addr = DialAddress::memory(port).with_peer(self.local_peer);
        debug!(peer = %self.local_peer.short_id(), addr = %local_addr, "Memory listener bound");
        Ok(Listener::new(local_addr, rx))
    }
}

/// Address directory backed by a fixed table
#[derive(Default)]
pub struct StaticDirectory {
    entries: DashMap<PeerId, Vec<DialAddress>>,
    delay_ms: AtomicU64,
    lookups: AtomicUsize,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, peer: PeerId, addrs: Vec<DialAddress>) {
        self.entries.insert(peer, addrs);
    }

    pub fn remove(&self, peer: &PeerId) {
        self.entries.remove(peer);
    }

    /// Delay every lookup, to exercise cancellation
    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AddressDirectory for StaticDirectory {
    async fn lookup(&self, peer: &PeerId) -> Vec<DialAddress> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.entries
            .get(peer)
            .map(|addrs| addrs.clone())
            .unwrap_or_default()
    }
}

/// NAT detector with fixed answers
#[derive(Default)]
pub struct StaticNat {
    local: NatType,
    remote: DashMap<PeerId, NatType>,
}

impl StaticNat {
    pub fn new(local: NatType) -> Self {
        Self {
            local,
            remote: DashMap::new(),
        }
    }

    pub fn set_remote(&self, peer: PeerId, nat: NatType) {
        self.remote.insert(peer, nat);
    }
}

#[async_trait]
impl NatDetector for StaticNat {
    fn local_nat(&self) -> NatType {
        self.local
    }

    async fn remote_nat(&self, peer: &PeerId) -> NatType {
        self.remote.get(peer).map(|n| *n).unwrap_or_default()
    }
}
