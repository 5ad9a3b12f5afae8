//! Dial coordinator
//!
//! Turns "connect to this identity" into exactly one verified connection:
//!
//! 1. Reuse a healthy primary connection if one exists.
//! 2. Otherwise join the attempt chain already running for the peer, or
//!    start one. Concurrent callers converge on a single chain.
//! 3. The chain looks up candidates (directory, then the address book, then
//!    relay address caches), ranks the direct ones and races them with
//!    bounded concurrency. The first dial that completes the handshake as
//!    the expected identity wins and the others are aborted.
//! 4. With no direct success, a relay-qualified candidate yields a circuit
//!    and the hole punch coordinator starts upgrading it in the background.
//! 5. Otherwise every per-address failure is reported in one error.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span, instrument, trace, warn};

use indras_core::{AddressDirectory, DialAddress, PeerId, RawConnection, Transport};
use indras_holepunch::HolePunchCoordinator;
use indras_relay::{APPLICATION_CIRCUIT_PROTOCOL, RelayClient};
use indras_transport::{Connection, ConnectionPath, LifecycleManager, MuxConfig, MuxSession, Role};

use crate::address_book::AddressBook;
use crate::config::DialConfig;
use crate::error::{ConnectError, DialFailure, FailureReason};

type Outcome = Option<Result<Connection, ConnectError>>;

/// One attempt chain shared by every caller connecting to the same peer
struct InFlight {
    outcome: watch::Receiver<Outcome>,
    waiters: AtomicUsize,
    cancel: CancellationToken,
}

/// Counters for connect calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DialStats {
    /// Attempt chains started
    pub chains: u64,
    /// Calls answered by an existing connection
    pub reused: u64,
    /// Calls that joined a chain already in flight
    pub joined: u64,
    pub direct: u64,
    pub relayed: u64,
    pub failed: u64,
}

struct DialInner {
    local: PeerId,
    config: DialConfig,
    mux: MuxConfig,
    transport: Arc<dyn Transport>,
    directory: Arc<dyn AddressDirectory>,
    lifecycle: LifecycleManager,
    relay: RelayClient,
    holepunch: HolePunchCoordinator,
    book: AddressBook,
    permits: Arc<Semaphore>,
    inflight: Mutex<HashMap<PeerId, Arc<InFlight>>>,
    chains: AtomicU64,
    reused: AtomicU64,
    joined: AtomicU64,
    direct: AtomicU64,
    relayed: AtomicU64,
    failed: AtomicU64,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Establishes connections by identity
#[derive(Clone)]
pub struct DialCoordinator {
    inner: Arc<DialInner>,
}

impl DialCoordinator {
    pub fn new(
        config: DialConfig,
        mux: MuxConfig,
        transport: Arc<dyn Transport>,
        directory: Arc<dyn AddressDirectory>,
        lifecycle: LifecycleManager,
        relay: RelayClient,
        holepunch: HolePunchCoordinator,
    ) -> Self {
        Self {
            inner: Arc::new(DialInner {
                local: transport.local_peer(),
                book: AddressBook::new(config.address_ttl(), config.max_addresses_per_peer),
                permits: Arc::new(Semaphore::new(config.max_pending_dials.max(1))),
                config,
                mux,
                transport,
                directory,
                lifecycle,
                relay,
                holepunch,
                inflight: Mutex::new(HashMap::new()),
                chains: AtomicU64::new(0),
                reused: AtomicU64::new(0),
                joined: AtomicU64::new(0),
                direct: AtomicU64::new(0),
                relayed: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &DialConfig {
        &self.inner.config
    }

    pub fn address_book(&self) -> &AddressBook {
        &self.inner.book
    }

    pub fn stats(&self) -> DialStats {
        DialStats {
            chains: self.inner.chains.load(Ordering::Relaxed),
            reused: self.inner.reused.load(Ordering::Relaxed),
            joined: self.inner.joined.load(Ordering::Relaxed),
            direct: self.inner.direct.load(Ordering::Relaxed),
            relayed: self.inner.relayed.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
        }
    }

    /// Peers with an attempt chain in flight
    pub fn in_flight(&self) -> usize {
        self.inner.inflight.lock().len()
    }

    /// Connect to `peer`, giving up at `deadline`
    pub async fn connect(&self, peer: PeerId, deadline: Instant) -> Result<Connection, ConnectError> {
        self.connect_with_cancel(peer, deadline, CancellationToken::new())
            .await
    }

    /// Connect to `peer`, giving up at `deadline` or when `cancel` fires
    ///
    /// The shared attempt chain stops once every caller waiting on it has
    /// given up.
    #[instrument(skip_all, fields(peer = %peer.short_id()))]
    pub async fn connect_with_cancel(
        &self,
        peer: PeerId,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> Result<Connection, ConnectError> {
        if peer == self.inner.local {
            return Err(ConnectError::SelfDial);
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(ConnectError::Shutdown);
        }
        if let Some(conn) = self.inner.lifecycle.primary(&peer) {
            self.inner.reused.fetch_add(1, Ordering::Relaxed);
            debug!(conn_id = conn.id(), path = %conn.path_kind(), "Reusing connection");
            return Ok(conn);
        }

        let waiter = self.join(peer, deadline);
        let mut outcome = waiter.flight.outcome.clone();
        tokio::select! {
            settled = outcome.wait_for(Option::is_some) => match settled {
                Ok(settled) => (*settled).clone().unwrap_or(Err(ConnectError::Cancelled)),
                Err(_) => Err(ConnectError::Cancelled),
            },
            _ = cancel.cancelled() => {
                debug!("Connect cancelled by caller");
                Err(ConnectError::Cancelled)
            }
            _ = tokio::time::sleep_until(deadline) => {
                debug!("Connect deadline elapsed");
                Err(ConnectError::Timeout)
            }
        }
    }

    /// Join the chain in flight for `peer`, or start one bounded by `deadline`
    fn join(&self, peer: PeerId, deadline: Instant) -> Waiter {
        let mut inflight = self.inner.inflight.lock();
        if let Some(flight) = inflight.get(&peer) {
            if !flight.cancel.is_cancelled() {
                flight.waiters.fetch_add(1, Ordering::SeqCst);
                self.inner.joined.fetch_add(1, Ordering::Relaxed);
                debug!("Joining connect already in flight");
                return Waiter {
                    inner: self.inner.clone(),
                    peer,
                    flight: flight.clone(),
                };
            }
        }

        let (tx, rx) = watch::channel(None);
        let flight = Arc::new(InFlight {
            outcome: rx,
            waiters: AtomicUsize::new(1),
            cancel: self.inner.shutdown.child_token(),
        });
        inflight.insert(peer, flight.clone());
        drop(inflight);
        self.inner.chains.fetch_add(1, Ordering::Relaxed);

        let coordinator = self.clone();
        let chain = flight.clone();
        let span = info_span!("connect_chain", peer = %peer.short_id());
        self.inner.tasks.spawn(
            async move {
                let outcome = tokio::select! {
                    result = coordinator.establish(peer, deadline) => result,
                    _ = chain.cancel.cancelled() => {
                        if coordinator.inner.shutdown.is_cancelled() {
                            Err(ConnectError::Shutdown)
                        } else {
                            Err(ConnectError::Cancelled)
                        }
                    }
                };
                tx.send_replace(Some(outcome));

                let mut inflight = coordinator.inner.inflight.lock();
                if inflight.get(&peer).is_some_and(|f| Arc::ptr_eq(f, &chain)) {
                    inflight.remove(&peer);
                }
            }
            .instrument(span),
        );

        Waiter {
            inner: self.inner.clone(),
            peer,
            flight,
        }
    }

    async fn establish(&self, peer: PeerId, deadline: Instant) -> Result<Connection, ConnectError> {
        let result = self.run_chain(peer, deadline).await;
        match &result {
            Ok(conn) if conn.relay_peer().is_some() => {
                self.inner.relayed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(_) => {
                self.inner.direct.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.inner.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    async fn run_chain(&self, peer: PeerId, deadline: Instant) -> Result<Connection, ConnectError> {
        // An inbound connection may have landed since the caller checked
        if let Some(conn) = self.inner.lifecycle.primary(&peer) {
            return Ok(conn);
        }

        let candidates = self.candidates(peer, deadline).await;
        if candidates.is_empty() {
            warn!("No candidate addresses");
            return Err(ConnectError::NoAddresses(peer));
        }
        let (relayed, direct): (Vec<_>, Vec<_>) =
            candidates.into_iter().partition(DialAddress::is_relayed);
        let mut failures = Vec::new();

        if !direct.is_empty() {
            let ranked = self.rank(&peer, direct);
            debug!(candidates = ranked.len(), "Racing direct candidates");
            if let Some(conn) = self.race(peer, ranked, deadline, &mut failures).await? {
                info!(conn_id = conn.id(), addr = %conn.remote_addr(), "Connected directly");
                return Ok(conn);
            }
        }

        for addr in self.rank(&peer, relayed) {
            if Instant::now() >= deadline {
                break;
            }
            match self.via_relay(peer, &addr, deadline).await {
                Ok(conn) => {
                    info!(conn_id = conn.id(), addr = %addr, "Connected through relay");
                    self.inner.holepunch.spawn_upgrade(conn.clone());
                    return Ok(conn);
                }
                Err(reason) => {
                    self.note_failure(&peer, &addr, &reason);
                    failures.push(DialFailure::new(addr, reason));
                }
            }
        }

        if Instant::now() >= deadline
            && failures.iter().all(|f| f.reason == FailureReason::Timeout)
        {
            return Err(ConnectError::Timeout);
        }
        let mismatched = failures.iter().find_map(|f| match f.reason {
            FailureReason::IdentityMismatch(actual) => Some(actual),
            _ => None,
        });
        if let Some(actual) = mismatched {
            if failures
                .iter()
                .all(|f| matches!(f.reason, FailureReason::IdentityMismatch(_)))
            {
                return Err(ConnectError::IdentityMismatch {
                    expected: peer,
                    actual,
                });
            }
        }

        warn!(failures = failures.len(), "Every candidate failed");
        Err(ConnectError::AllFailed { failures })
    }

    /// Directory results plus the address book; relay caches only when both are empty
    async fn candidates(&self, peer: PeerId, deadline: Instant) -> Vec<DialAddress> {
        let looked_up = tokio::time::timeout_at(deadline, self.inner.directory.lookup(&peer))
            .await
            .unwrap_or_else(|_| {
                debug!("Directory lookup timed out");
                Vec::new()
            });
        self.inner.book.insert_unverified(peer, &looked_up);

        let known = self.inner.book.addresses(&peer);
        let mut usable = self.usable(peer, looked_up.into_iter().chain(known));
        if usable.is_empty() {
            let cached = self.query_relays(peer, deadline).await;
            self.inner.book.insert_unverified(peer, &cached);
            usable = self.usable(peer, cached);
        }
        usable
    }

    fn usable(&self, peer: PeerId, addrs: impl IntoIterator<Item = DialAddress>) -> Vec<DialAddress> {
        let mut usable: Vec<DialAddress> = Vec::new();
        for addr in addrs {
            if usable.contains(&addr) {
                continue;
            }
            if addr.peer_id().is_some_and(|named| named != peer) {
                trace!(addr = %addr, "Skipping address naming another peer");
                continue;
            }
            let first_hop = addr.relay_base().unwrap_or_else(|| addr.clone());
            if !self.inner.transport.supports(&first_hop) {
                trace!(addr = %addr, "Skipping unsupported address");
                continue;
            }
            usable.push(addr);
        }
        usable
    }

    /// Ask relays we hold reservations with what they have cached for `peer`
    ///
    /// A hit also means the peer is reserved there, so the relay's circuit
    /// address for it becomes a candidate too.
    async fn query_relays(&self, peer: PeerId, deadline: Instant) -> Vec<DialAddress> {
        for relay in self.inner.relay.relay_connections() {
            let relay_peer = relay.remote_peer();
            let query = self.inner.relay.query_address(&relay, peer);
            match tokio::time::timeout_at(deadline, query).await {
                Ok(Ok(Some(record))) => {
                    debug!(
                        relay = %relay_peer.short_id(),
                        addresses = record.addresses.len(),
                        age_ms = record.age_ms,
                        "Relay cache hit"
                    );
                    let mut found = record.addresses;
                    found.push(DialAddress::circuit(
                        &relay.remote_addr().with_peer(relay_peer),
                        peer,
                    ));
                    return found;
                }
                Ok(Ok(None)) => trace!(relay = %relay_peer.short_id(), "Relay cache miss"),
                Ok(Err(e)) => debug!(relay = %relay_peer.short_id(), error = %e, "Address query failed"),
                Err(_) => break,
            }
        }
        Vec::new()
    }

    /// Order candidates: local first, preferred transport, success history,
    /// then lexical. Relay addresses through relays we already reach go first.
    fn rank(&self, peer: &PeerId, addrs: Vec<DialAddress>) -> Vec<DialAddress> {
        let mut keyed: Vec<_> = addrs
            .into_iter()
            .map(|addr| {
                let relay_ready = addr
                    .relay_peer()
                    .is_some_and(|relay| self.inner.lifecycle.primary(&relay).is_some());
                let rate = self.inner.book.success_rate(peer, &addr);
                let text = addr.to_string();
                (addr, relay_ready, rate, text)
            })
            .collect();
        keyed.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then_with(|| b.0.is_local().cmp(&a.0.is_local()))
                .then_with(|| a.0.transport_kind().cmp(&b.0.transport_kind()))
                .then_with(|| b.2.total_cmp(&a.2))
                .then_with(|| a.3.cmp(&b.3))
        });
        keyed.into_iter().map(|(addr, ..)| addr).collect()
    }

    /// Race direct candidates; the first verified dial wins
    async fn race(
        &self,
        peer: PeerId,
        ranked: Vec<DialAddress>,
        deadline: Instant,
        failures: &mut Vec<DialFailure>,
    ) -> Result<Option<Connection>, ConnectError> {
        let limit = self.inner.config.max_parallel_dials.max(1);
        let mut queue: VecDeque<DialAddress> = ranked.into();
        let mut attempts = JoinSet::new();

        loop {
            while attempts.len() < limit {
                let Some(addr) = queue.pop_front() else {
                    break;
                };
                let Ok(permit) = self.inner.permits.clone().try_acquire_owned() else {
                    queue.push_front(addr);
                    if attempts.is_empty() {
                        warn!(max = self.inner.config.max_pending_dials, "Dial limit reached");
                        return Err(ConnectError::ResourceExhausted(format!(
                            "{} dials in flight",
                            self.inner.config.max_pending_dials
                        )));
                    }
                    break;
                };
                let attempt_deadline =
                    deadline.min(Instant::now() + self.inner.config.dial_timeout());
                attempts.spawn(dial_attempt(
                    self.inner.transport.clone(),
                    peer,
                    addr,
                    attempt_deadline,
                    permit,
                ));
            }

            let Some(joined) = attempts.join_next().await else {
                return Ok(None);
            };
            let (addr, raw) = match joined {
                Ok(Ok(won)) => won,
                Ok(Err(failure)) => {
                    self.note_failure(&peer, &failure.address, &failure.reason);
                    failures.push(failure);
                    continue;
                }
                Err(e) => {
                    debug!(error = %e, "Dial attempt task ended abnormally");
                    continue;
                }
            };

            attempts.abort_all();
            while let Some(loser) = attempts.join_next().await {
                if let Ok(Ok((addr, _raw))) = loser {
                    trace!(addr = %addr, "Discarding slower dial");
                }
            }

            self.inner.book.record_success(peer, &addr);
            let session = MuxSession::new(raw.io, Role::Dialer, self.inner.mux.clone());
            let path = ConnectionPath::direct(session, raw.local_addr, raw.remote_addr);
            let conn = self.inner.lifecycle.adopt_direct(peer, path)?;
            return Ok(Some(conn));
        }
    }

    /// Open an application circuit to `peer` through the relay `addr` names
    async fn via_relay(
        &self,
        peer: PeerId,
        addr: &DialAddress,
        deadline: Instant,
    ) -> Result<Connection, FailureReason> {
        let (Some(relay_addr), Some(relay_peer)) = (addr.relay_base(), addr.relay_peer()) else {
            return Err(FailureReason::Unusable(addr.to_string()));
        };
        if relay_peer == peer || relay_peer == self.inner.local {
            return Err(FailureReason::Unusable(addr.to_string()));
        }

        let relay = self.relay_connection(relay_peer, &relay_addr, deadline).await?;
        let path = self
            .inner
            .relay
            .open_circuit(&relay, peer, APPLICATION_CIRCUIT_PROTOCOL, deadline)
            .await?;
        self.inner.book.record_success(peer, addr);
        self.inner
            .lifecycle
            .register(Connection::new(peer, path))
            .map_err(|e| FailureReason::Relay(e.to_string()))
    }

    /// An existing connection to the relay, or a fresh direct dial
    async fn relay_connection(
        &self,
        relay: PeerId,
        addr: &DialAddress,
        deadline: Instant,
    ) -> Result<Connection, FailureReason> {
        if let Some(conn) = self.inner.lifecycle.primary(&relay) {
            return Ok(conn);
        }
        let permit = self
            .inner
            .permits
            .clone()
            .try_acquire_owned()
            .map_err(|_| FailureReason::DialLimit)?;
        let attempt_deadline = deadline.min(Instant::now() + self.inner.config.dial_timeout());
        let (_, raw) = dial_attempt(
            self.inner.transport.clone(),
            relay,
            addr.clone(),
            attempt_deadline,
            permit,
        )
        .await
        .map_err(|failure| failure.reason)?;

        self.inner.book.record_success(relay, addr);
        let session = MuxSession::new(raw.io, Role::Dialer, self.inner.mux.clone());
        self.inner
            .lifecycle
            .adopt_direct(
                relay,
                ConnectionPath::direct(session, raw.local_addr, raw.remote_addr),
            )
            .map_err(|e| FailureReason::Relay(e.to_string()))
    }

    fn note_failure(&self, peer: &PeerId, addr: &DialAddress, reason: &FailureReason) {
        match reason {
            FailureReason::IdentityMismatch(actual) => {
                error!(
                    addr = %addr,
                    expected = %peer.short_id(),
                    actual = %actual.short_id(),
                    "Address answered with the wrong identity"
                );
                self.inner.book.evict(peer, addr);
            }
            other => {
                debug!(addr = %addr, reason = %other, "Dial attempt failed");
                self.inner.book.record_failure(peer, addr);
            }
        }
    }

    /// Cancel every attempt chain and wait for them to wind down
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        debug!("Dial coordinator stopped");
    }
}

/// A caller's hold on a shared attempt chain
///
/// The last waiter to leave before the chain settles cancels it.
struct Waiter {
    inner: Arc<DialInner>,
    peer: PeerId,
    flight: Arc<InFlight>,
}

impl Drop for Waiter {
    fn drop(&mut self) {
        let mut inflight = self.inner.inflight.lock();
        let last = self.flight.waiters.fetch_sub(1, Ordering::SeqCst) == 1;
        if last && self.flight.outcome.borrow().is_none() {
            debug!(peer = %self.peer.short_id(), "Every caller left, cancelling connect");
            self.flight.cancel.cancel();
            if inflight
                .get(&self.peer)
                .is_some_and(|f| Arc::ptr_eq(f, &self.flight))
            {
                inflight.remove(&self.peer);
            }
        }
    }
}

/// One transport dial, rejected unless it verifies as `peer`
async fn dial_attempt(
    transport: Arc<dyn Transport>,
    peer: PeerId,
    addr: DialAddress,
    deadline: Instant,
    _permit: OwnedSemaphorePermit,
) -> Result<(DialAddress, RawConnection), DialFailure> {
    let raw = match tokio::time::timeout_at(deadline, transport.dial(&addr, deadline)).await {
        Ok(Ok(raw)) => raw,
        Ok(Err(e)) => return Err(DialFailure::new(addr, e)),
        Err(_) => return Err(DialFailure::new(addr, FailureReason::Timeout)),
    };
    if raw.remote_peer != peer {
        return Err(DialFailure::new(
            addr,
            FailureReason::IdentityMismatch(raw.remote_peer),
        ));
    }
    Ok((addr, raw))
}
