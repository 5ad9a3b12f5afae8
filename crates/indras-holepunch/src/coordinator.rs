//! NAT traversal coordinator
//!
//! Drives the per-peer punch state machine
//! `Idle -> Evaluating -> Coordinating -> {Succeeded, Failed}`.
//!
//! The side that opened the relayed connection initiates. Each round opens
//! a fresh control circuit through the relay as its signaling channel,
//! exchanges addresses, then both sides dial each other at a synchronized
//! moment. The initiator picks the first direct connection that appears
//! (outbound, or inbound via [`HolePunchCoordinator::offer_inbound`]) and
//! confirms it on the connection itself before either side adopts it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, trace, warn};

use indras_core::codec::{read_frame, write_frame};
use indras_core::{
    DialAddress, HOLEPUNCH_PROTOCOL, NatDetector, NatType, PathKind, PeerId, Transport,
    punch_feasible,
};
use indras_relay::{InboundCircuit, RelayClient, SignalingChannel, SignalingError};
use indras_transport::{
    Connection, ConnectionPath, LifecycleManager, MuxConfig, MuxSession, Role, Stream,
};

use crate::config::HolePunchConfig;
use crate::error::PunchError;
use crate::protocol::PunchMessage;

/// Punch progress for one remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PunchState {
    #[default]
    Idle,
    Evaluating,
    Coordinating,
    Succeeded,
    Failed,
}

impl PunchState {
    pub fn is_active(&self) -> bool {
        matches!(self, PunchState::Evaluating | PunchState::Coordinating)
    }
}

/// Counters across all peers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PunchStats {
    /// Rounds that reached the signaling channel, either side
    pub rounds: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Upgrades skipped because the NAT pairing cannot be punched
    pub infeasible: u64,
}

type CandidateTx = mpsc::UnboundedSender<ConnectionPath>;

struct Inner {
    local: PeerId,
    config: HolePunchConfig,
    transport: Arc<dyn Transport>,
    nat: Arc<dyn NatDetector>,
    relay: RelayClient,
    lifecycle: LifecycleManager,
    mux: MuxConfig,
    advertised: RwLock<Vec<DialAddress>>,
    states: DashMap<PeerId, PunchState>,
    /// Open rounds, keyed by remote peer, fed with direct candidates
    rounds: DashMap<PeerId, CandidateTx>,
    rounds_started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    infeasible: AtomicU64,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Upgrades relayed connections to direct ones by hole punching
#[derive(Clone)]
pub struct HolePunchCoordinator {
    inner: Arc<Inner>,
}

impl HolePunchCoordinator {
    pub fn new(
        local: PeerId,
        config: HolePunchConfig,
        transport: Arc<dyn Transport>,
        nat: Arc<dyn NatDetector>,
        relay: RelayClient,
        lifecycle: LifecycleManager,
        mux: MuxConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                local,
                config,
                transport,
                nat,
                relay,
                lifecycle,
                mux,
                advertised: RwLock::new(Vec::new()),
                states: DashMap::new(),
                rounds: DashMap::new(),
                rounds_started: AtomicU64::new(0),
                succeeded: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                infeasible: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &HolePunchConfig {
        &self.inner.config
    }

    pub fn state(&self, peer: &PeerId) -> PunchState {
        self.inner
            .states
            .get(peer)
            .map(|s| *s)
            .unwrap_or_default()
    }

    pub fn stats(&self) -> PunchStats {
        PunchStats {
            rounds: self.inner.rounds_started.load(Ordering::Relaxed),
            succeeded: self.inner.succeeded.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
            infeasible: self.inner.infeasible.load(Ordering::Relaxed),
        }
    }

    /// Addresses offered to peers as punch targets. Relayed ones are ignored.
    pub fn set_advertised_addresses(&self, addresses: Vec<DialAddress>) {
        let direct = addresses.into_iter().filter(|a| !a.is_relayed()).collect();
        *self.inner.advertised.write() = direct;
    }

    pub fn advertised_addresses(&self) -> Vec<DialAddress> {
        self.inner.advertised.read().clone()
    }

    /// Whether a round with `peer` is waiting for direct connections
    pub fn is_punching(&self, peer: &PeerId) -> bool {
        self.inner.rounds.contains_key(peer)
    }

    /// Hand an inbound direct connection to a running round
    ///
    /// Returns the path back when no round with `peer` is open, in which
    /// case the caller treats it as an ordinary inbound connection.
    pub fn offer_inbound(&self, peer: PeerId, path: ConnectionPath) -> Option<ConnectionPath> {
        let Some(tx) = self.inner.rounds.get(&peer).map(|tx| tx.clone()) else {
            return Some(path);
        };
        match tx.send(path) {
            Ok(()) => {
                trace!(peer = %peer.short_id(), "Inbound connection handed to punch round");
                None
            }
            Err(mpsc::error::SendError(path)) => Some(path),
        }
    }

    /// Try to upgrade `conn` in the background
    ///
    /// The attempt ends with the connection, on shutdown, or when its
    /// rounds run out.
    pub fn spawn_upgrade(&self, conn: Connection) {
        if !self.inner.config.enabled
            || self.inner.shutdown.is_cancelled()
            || conn.path_kind() != PathKind::Relayed
        {
            return;
        }
        let coordinator = self.clone();
        let cancel = self.inner.shutdown.child_token();
        self.inner.tasks.spawn(async move {
            let _ = coordinator.upgrade(&conn, cancel).await;
        });
    }

    /// Upgrade a relayed connection to a direct path
    ///
    /// On success the connection's handle stays the same and its relayed
    /// path is retained by the lifecycle manager as a backup. On failure the
    /// relayed path stays live.
    #[instrument(skip_all, fields(peer = %conn.remote_peer().short_id(), conn_id = conn.id()))]
    pub async fn upgrade(
        &self,
        conn: &Connection,
        cancel: CancellationToken,
    ) -> Result<(), PunchError> {
        if !self.inner.config.enabled {
            return Err(PunchError::Disabled);
        }
        let peer = conn.remote_peer();
        let relay = conn.relay_peer().ok_or(PunchError::NotRelayed)?;
        if !self.claim(peer) {
            return Err(PunchError::InProgress);
        }

        self.inner.lifecycle.set_upgrading(conn, true);
        let result = tokio::select! {
            result = self.run_upgrade(conn, peer, relay) => result,
            _ = cancel.cancelled() => Err(PunchError::Cancelled),
            _ = self.inner.shutdown.cancelled() => Err(PunchError::Cancelled),
            _ = conn.closed() => Err(PunchError::Cancelled),
        };
        self.inner.lifecycle.set_upgrading(conn, false);

        match &result {
            Ok(()) => {
                self.inner.succeeded.fetch_add(1, Ordering::Relaxed);
                self.set_state(peer, PunchState::Succeeded);
            }
            Err(PunchError::Infeasible { .. }) => {
                self.inner.infeasible.fetch_add(1, Ordering::Relaxed);
                self.set_state(peer, PunchState::Failed);
            }
            Err(PunchError::Cancelled) => {
                debug!("Hole punch cancelled");
                self.set_state(peer, PunchState::Failed);
            }
            Err(e) => {
                self.inner.failed.fetch_add(1, Ordering::Relaxed);
                self.set_state(peer, PunchState::Failed);
                warn!(error = %e, "Hole punch failed, relayed path remains");
            }
        }
        result
    }

    fn claim(&self, peer: PeerId) -> bool {
        match self.inner.states.entry(peer) {
            Entry::Occupied(mut entry) => {
                if entry.get().is_active() {
                    return false;
                }
                entry.insert(PunchState::Evaluating);
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(PunchState::Evaluating);
                true
            }
        }
    }

    fn set_state(&self, peer: PeerId, state: PunchState) {
        self.inner.states.insert(peer, state);
    }

    async fn run_upgrade(
        &self,
        conn: &Connection,
        peer: PeerId,
        relay: PeerId,
    ) -> Result<(), PunchError> {
        let local_nat = self.inner.nat.local_nat();
        let remote_nat = self.inner.nat.remote_nat(&peer).await;
        if !punch_feasible(local_nat, remote_nat) {
            info!(
                ?local_nat,
                ?remote_nat,
                "Hole punch infeasible, staying relayed"
            );
            return Err(PunchError::Infeasible {
                local: local_nat,
                remote: remote_nat,
            });
        }

        let max_attempts = self.inner.config.max_attempts.max(1);
        let mut round = 1;
        loop {
            if conn.path_kind() == PathKind::Direct {
                return Ok(());
            }
            self.set_state(peer, PunchState::Coordinating);
            match self.initiate(conn, peer, relay, round, local_nat).await {
                Ok(()) => return Ok(()),
                Err(e) if round < max_attempts && e.is_retryable() => {
                    let backoff = self.inner.config.backoff(round);
                    debug!(
                        round,
                        error = %e,
                        backoff_ms = backoff.as_millis() as u64,
                        "Punch round failed, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    round += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One initiator round over a fresh signaling circuit
    async fn initiate(
        &self,
        conn: &Connection,
        peer: PeerId,
        relay: PeerId,
        round: u32,
        nat: NatType,
    ) -> Result<(), PunchError> {
        let deadline = Instant::now() + self.inner.config.punch_timeout();
        let relay_conn = self
            .inner
            .lifecycle
            .primary(&relay)
            .filter(|c| c.is_healthy())
            .ok_or(PunchError::NoRelay(relay))?;

        self.inner.rounds_started.fetch_add(1, Ordering::Relaxed);
        let circuit = self
            .inner
            .relay
            .open_circuit(&relay_conn, peer, HOLEPUNCH_PROTOCOL, deadline)
            .await?;
        let _circuit = SessionGuard(circuit.session.clone());
        let stream = circuit.session.open_stream(HOLEPUNCH_PROTOCOL).await?;
        let channel = SignalingChannel::new(stream, self.inner.local, peer)
            .with_timeout(self.inner.config.signaling_timeout());

        let result = tokio::time::timeout_at(
            deadline,
            self.coordinate(conn, peer, round, nat, deadline, &channel),
        )
        .await
        .unwrap_or(Err(PunchError::Timeout));

        if result.is_err() {
            let _ = channel.send(&PunchMessage::Failed { round });
        }
        result
    }

    async fn coordinate(
        &self,
        conn: &Connection,
        peer: PeerId,
        round: u32,
        nat: NatType,
        deadline: Instant,
        channel: &SignalingChannel,
    ) -> Result<(), PunchError> {
        let started = Instant::now();
        let reply: PunchMessage = channel
            .request(&PunchMessage::Connect {
                round,
                addresses: self.advertised_addresses(),
                nat,
            })
            .await?;
        let rtt = started.elapsed();
        let (addresses, remote_nat) = match reply {
            PunchMessage::ConnectAck { addresses, nat } => (addresses, nat),
            other => {
                return Err(PunchError::Protocol(format!(
                    "expected connect-ack, got {}",
                    other.name()
                )));
            }
        };

        let targets = direct_candidates(&addresses, peer);
        if targets.is_empty() {
            return Err(PunchError::NoCandidates);
        }

        let mut slot = self.open_round(peer)?;
        channel.send(&PunchMessage::Sync { round })?;
        debug!(
            round,
            rtt_ms = rtt.as_millis() as u64,
            ?remote_nat,
            targets = targets.len(),
            "Punch synchronized"
        );

        // The responder starts dialing as soon as Sync lands
        tokio::time::sleep(rtt / 2).await;
        let _dialers = self.spawn_dialers(peer, targets, deadline, slot.sender());

        while let Some(path) = slot.next().await {
            match self.confirm(&path, round).await {
                Ok(()) => {
                    let addr = path.remote_addr.clone();
                    self.inner.lifecycle.upgrade(conn, path)?;
                    let _ = channel.send(&PunchMessage::Succeeded { round });
                    info!(round, addr = %addr, "Hole punch succeeded, connection is direct");
                    return Ok(());
                }
                Err(e) => {
                    debug!(addr = %path.remote_addr, error = %e, "Punch candidate rejected");
                    path.session.close();
                }
            }
        }
        Err(PunchError::Timeout)
    }

    /// Tell the responder which path won and wait for its acknowledgement
    async fn confirm(&self, path: &ConnectionPath, round: u32) -> Result<(), PunchError> {
        let mut stream = path.session.open_stream(HOLEPUNCH_PROTOCOL).await?;
        let exchange = async {
            write_frame(&mut stream, &PunchMessage::Selected { round }).await?;
            read_frame::<_, PunchMessage>(&mut stream).await
        };
        match tokio::time::timeout(self.inner.config.signaling_timeout(), exchange).await {
            Ok(Ok(PunchMessage::SelectedAck)) => Ok(()),
            Ok(Ok(other)) => Err(PunchError::Protocol(format!(
                "expected selected-ack, got {}",
                other.name()
            ))),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(PunchError::Timeout),
        }
    }

    /// Answer a punch round opened towards us over a control circuit
    pub fn respond(&self, circuit: InboundCircuit) {
        if !self.inner.config.enabled || self.inner.shutdown.is_cancelled() {
            circuit.path.session.close();
            return;
        }
        let coordinator = self.clone();
        self.inner.tasks.spawn(async move {
            let peer = circuit.peer;
            let session = circuit.path.session.clone();
            let _circuit = SessionGuard(session.clone());
            let result = tokio::select! {
                result = coordinator.answer(peer, &session) => result,
                _ = coordinator.inner.shutdown.cancelled() => Err(PunchError::Cancelled),
            };
            match result {
                Ok(()) => {
                    coordinator.inner.succeeded.fetch_add(1, Ordering::Relaxed);
                    coordinator.set_state(peer, PunchState::Succeeded);
                }
                // Another round owns this peer; leave its state alone
                Err(PunchError::InProgress) => {
                    debug!(peer = %peer.short_id(), "Ignoring punch round, one is already open");
                }
                Err(e) => {
                    coordinator.inner.failed.fetch_add(1, Ordering::Relaxed);
                    coordinator.set_state(peer, PunchState::Failed);
                    debug!(peer = %peer.short_id(), error = %e, "Responder punch round failed");
                }
            }
        });
    }

    #[instrument(skip_all, fields(peer = %peer.short_id()))]
    async fn answer(&self, peer: PeerId, session: &MuxSession) -> Result<(), PunchError> {
        let timeout = self.inner.config.signaling_timeout();
        let stream = tokio::time::timeout(timeout, session.accept())
            .await
            .map_err(|_| PunchError::Timeout)?
            .ok_or(PunchError::Signaling(SignalingError::Closed))?;
        if stream.protocol() != HOLEPUNCH_PROTOCOL {
            let protocol = stream.protocol().to_string();
            stream.reset();
            return Err(PunchError::Protocol(format!(
                "unexpected signaling protocol {protocol}"
            )));
        }
        let channel = SignalingChannel::new(stream, self.inner.local, peer).with_timeout(timeout);

        let (request_id, request) = channel.recv_timeout::<PunchMessage>().await?;
        let (round, addresses, remote_nat) = match request {
            PunchMessage::Connect {
                round,
                addresses,
                nat,
            } => (round, addresses, nat),
            other => {
                return Err(PunchError::Protocol(format!(
                    "expected connect, got {}",
                    other.name()
                )));
            }
        };
        let targets = direct_candidates(&addresses, peer);

        let mut slot = self.open_round(peer)?;
        self.set_state(peer, PunchState::Coordinating);
        self.inner.rounds_started.fetch_add(1, Ordering::Relaxed);
        channel.reply(
            request_id,
            &PunchMessage::ConnectAck {
                addresses: self.advertised_addresses(),
                nat: self.inner.nat.local_nat(),
            },
        )?;

        match channel.recv_timeout::<PunchMessage>().await? {
            (_, PunchMessage::Sync { round: synced }) if synced == round => {}
            (_, PunchMessage::Failed { .. }) => return Err(PunchError::Abandoned),
            (_, other) => {
                return Err(PunchError::Protocol(format!(
                    "expected sync, got {}",
                    other.name()
                )));
            }
        }

        let deadline = Instant::now() + self.inner.config.punch_timeout();
        debug!(round, ?remote_nat, targets = targets.len(), "Punch synchronized, dialing");
        let _dialers = self.spawn_dialers(peer, targets, deadline, slot.sender());

        let mut candidates: Vec<MuxSession> = Vec::new();
        let mut waiting: JoinSet<Option<(ConnectionPath, Stream)>> = JoinSet::new();
        let selected = tokio::time::timeout_at(deadline, async {
            loop {
                tokio::select! {
                    Some(path) = slot.next() => {
                        candidates.push(path.session.clone());
                        waiting.spawn(await_selection(path, round, timeout));
                    }
                    Some(joined) = waiting.join_next() => {
                        if let Ok(Some(selected)) = joined {
                            return Ok(selected);
                        }
                    }
                    message = channel.recv::<PunchMessage>() => match message {
                        Ok((_, PunchMessage::Failed { .. })) => return Err(PunchError::Abandoned),
                        Ok((_, other)) => trace!(kind = other.name(), "Ignoring signaling message"),
                        Err(e) => return Err(PunchError::Signaling(e)),
                    },
                }
            }
        })
        .await
        .unwrap_or(Err(PunchError::Timeout));

        let (path, mut stream) = match selected {
            Ok(selected) => selected,
            Err(e) => {
                for session in &candidates {
                    session.close();
                }
                return Err(e);
            }
        };
        for session in candidates.iter().filter(|s| !s.ptr_eq(&path.session)) {
            session.close();
        }

        let addr = path.remote_addr.clone();
        let conn = self.inner.lifecycle.adopt_direct(peer, path)?;
        write_frame(&mut stream, &PunchMessage::SelectedAck).await?;
        info!(round, conn_id = conn.id(), addr = %addr, "Hole punch succeeded, adopted direct path");
        Ok(())
    }

    fn open_round(&self, peer: PeerId) -> Result<RoundSlot, PunchError> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.inner.rounds.entry(peer) {
            Entry::Occupied(_) => Err(PunchError::InProgress),
            Entry::Vacant(entry) => {
                entry.insert(tx.clone());
                Ok(RoundSlot {
                    inner: self.inner.clone(),
                    peer,
                    tx,
                    rx,
                })
            }
        }
    }

    fn spawn_dialers(
        &self,
        peer: PeerId,
        targets: Vec<DialAddress>,
        deadline: Instant,
        tx: CandidateTx,
    ) -> JoinSet<()> {
        let mut dialers = JoinSet::new();
        for addr in targets {
            dialers.spawn(dial_until(
                self.inner.transport.clone(),
                addr,
                peer,
                self.inner.mux.clone(),
                self.inner.config.dial_interval(),
                deadline,
                tx.clone(),
            ));
        }
        dialers
    }

    /// Stop every round and wait for background work to finish
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}

/// An open round's candidate queue. Unregisters and closes leftovers on drop.
struct RoundSlot {
    inner: Arc<Inner>,
    peer: PeerId,
    tx: CandidateTx,
    rx: mpsc::UnboundedReceiver<ConnectionPath>,
}

impl RoundSlot {
    fn sender(&self) -> CandidateTx {
        self.tx.clone()
    }

    async fn next(&mut self) -> Option<ConnectionPath> {
        self.rx.recv().await
    }
}

impl Drop for RoundSlot {
    fn drop(&mut self) {
        self.inner
            .rounds
            .remove_if(&self.peer, |_, tx| tx.same_channel(&self.tx));
        self.rx.close();
        while let Ok(path) = self.rx.try_recv() {
            path.session.close();
        }
    }
}

struct SessionGuard(MuxSession);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// Direct addresses worth dialing for `peer`, deduplicated
fn direct_candidates(addresses: &[DialAddress], peer: PeerId) -> Vec<DialAddress> {
    let mut targets: Vec<DialAddress> = Vec::new();
    for addr in addresses {
        if addr.is_relayed() || addr.peer_id().is_some_and(|named| named != peer) {
            continue;
        }
        if !targets.contains(addr) {
            targets.push(addr.clone());
        }
    }
    targets
}

/// Dial `addr` repeatedly until it answers, the deadline passes, or the round closes
async fn dial_until(
    transport: Arc<dyn Transport>,
    addr: DialAddress,
    peer: PeerId,
    mux: MuxConfig,
    interval: Duration,
    deadline: Instant,
    tx: CandidateTx,
) {
    while !tx.is_closed() && Instant::now() < deadline {
        match transport.dial(&addr, deadline).await {
            Ok(raw) if raw.remote_peer == peer => {
                let session = MuxSession::new(raw.io, Role::Dialer, mux);
                let path = ConnectionPath::direct(session, raw.local_addr, raw.remote_addr);
                if let Err(mpsc::error::SendError(path)) = tx.send(path) {
                    path.session.close();
                }
                return;
            }
            Ok(raw) => {
                error!(
                    addr = %addr,
                    expected = %peer.short_id(),
                    actual = %raw.remote_peer.short_id(),
                    "Punch dial reached a different identity"
                );
                return;
            }
            Err(e) => trace!(addr = %addr, error = %e, "Punch dial failed"),
        }
        tokio::time::sleep(interval).await;
    }
}

/// Wait for the initiator to pick this candidate
async fn await_selection(
    path: ConnectionPath,
    round: u32,
    timeout: Duration,
) -> Option<(ConnectionPath, Stream)> {
    let mut stream = tokio::time::timeout(timeout, path.session.accept())
        .await
        .ok()??;
    if stream.protocol() != HOLEPUNCH_PROTOCOL {
        stream.reset();
        return None;
    }
    match tokio::time::timeout(timeout, read_frame::<_, PunchMessage>(&mut stream)).await {
        Ok(Ok(PunchMessage::Selected { round: selected })) if selected == round => {
            Some((path, stream))
        }
        _ => None,
    }
}
