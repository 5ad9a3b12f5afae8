//! Relay client
//!
//! Holds reservations with relays, keeps them renewed, queries relay
//! address caches, and turns relay streams into circuits.
//!
//! A circuit is a [`Connection`] built on a stream: once the relay reports
//! the circuit open, both ends prove their identities over it with the
//! configured [`SecureUpgrade`] and run a fresh [`MuxSession`] on top, so
//! any number of logical streams ride the single forwarded path.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use indras_core::codec::{read_frame, write_frame};
use indras_core::{
    DialAddress, PeerId, ProtocolCategory, RELAY_HOP_PROTOCOL, SecureUpgrade, TransportError,
};
use indras_transport::{
    Connection, ConnectionPath, LifecycleManager, MuxConfig, MuxSession, Role, Stream,
};

use crate::config::RelayClientConfig;
use crate::error::{DenyReason, RelayError};
use crate::protocol::{
    AddressRecord, HopRequest, HopResponse, ReservationGrant, StopRequest, StopResponse,
};

const INBOUND_BACKLOG: usize = 32;
const EVENT_CAPACITY: usize = 64;

/// A reservation held with a relay
#[derive(Debug, Clone, PartialEq)]
pub struct Reservation {
    pub relay: PeerId,
    /// The relay's own address, naming the relay identity
    pub relay_addr: DialAddress,
    pub grant: ReservationGrant,
    pub expires_at: Instant,
}

impl Reservation {
    /// Relay-qualified address other peers can use to reach `local`
    pub fn circuit_address(&self, local: PeerId) -> DialAddress {
        DialAddress::circuit(&self.relay_addr, local)
    }
}

/// A circuit opened towards us through a relay, identity already verified
#[derive(Debug)]
pub struct InboundCircuit {
    pub peer: PeerId,
    pub relay: PeerId,
    pub category: ProtocolCategory,
    pub protocol: String,
    pub path: ConnectionPath,
}

/// Reservation lifecycle notifications
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Reserved { relay: PeerId },
    Renewed { relay: PeerId },
    /// Renewal failed too often; circuits through the relay were degraded
    ReservationLost { relay: PeerId, degraded: usize },
}

struct HeldReservation {
    reservation: Reservation,
    conn: Connection,
    addresses: Vec<DialAddress>,
    generation: u64,
    cancel: CancellationToken,
}

struct ClientInner {
    local: PeerId,
    config: RelayClientConfig,
    mux: MuxConfig,
    upgrade: Arc<dyn SecureUpgrade>,
    lifecycle: LifecycleManager,
    reservations: DashMap<PeerId, HeldReservation>,
    next_generation: AtomicU64,
    inbound: mpsc::Sender<InboundCircuit>,
    events: broadcast::Sender<RelayEvent>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Client side of the relay protocols
#[derive(Clone)]
pub struct RelayClient {
    inner: Arc<ClientInner>,
}

impl RelayClient {
    /// Create a client. Inbound circuits are delivered on the returned receiver.
    pub fn new(
        local: PeerId,
        upgrade: Arc<dyn SecureUpgrade>,
        lifecycle: LifecycleManager,
        mux: MuxConfig,
        config: RelayClientConfig,
    ) -> (Self, mpsc::Receiver<InboundCircuit>) {
        let (inbound, inbound_rx) = mpsc::channel(INBOUND_BACKLOG);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let client = Self {
            inner: Arc::new(ClientInner {
                local,
                config,
                mux,
                upgrade,
                lifecycle,
                reservations: DashMap::new(),
                next_generation: AtomicU64::new(1),
                inbound,
                events,
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        };
        (client, inbound_rx)
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.local
    }

    pub fn config(&self) -> &RelayClientConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.inner.events.subscribe()
    }

    pub fn reservation(&self, relay: &PeerId) -> Option<Reservation> {
        self.inner
            .reservations
            .get(relay)
            .map(|held| held.reservation.clone())
    }

    pub fn reservations(&self) -> Vec<Reservation> {
        self.inner
            .reservations
            .iter()
            .map(|held| held.reservation.clone())
            .collect()
    }

    pub fn has_reservation(&self, relay: &PeerId) -> bool {
        self.inner.reservations.contains_key(relay)
    }

    /// Connections to relays we hold reservations with
    pub fn relay_connections(&self) -> Vec<Connection> {
        self.inner
            .reservations
            .iter()
            .map(|held| held.conn.clone())
            .filter(|conn| conn.is_healthy())
            .collect()
    }

    /// Relay-qualified addresses at which we can currently be reached
    pub fn circuit_addresses(&self) -> Vec<DialAddress> {
        self.reservations()
            .iter()
            .map(|r| r.circuit_address(self.inner.local))
            .collect()
    }

    /// Send one hop request and read the relay's reply
    async fn request(
        &self,
        relay: &Connection,
        request: &HopRequest,
    ) -> Result<(Stream, HopResponse), RelayError> {
        let mut stream = relay.open_stream(RELAY_HOP_PROTOCOL).await?;
        let exchange = async {
            write_frame(&mut stream, request).await?;
            read_frame::<_, HopResponse>(&mut stream).await
        };
        let response = tokio::time::timeout(self.inner.config.request_timeout(), exchange)
            .await
            .map_err(|_| RelayError::Timeout)??;
        Ok((stream, response))
    }

    async fn reserve_once(
        &self,
        relay: &Connection,
        addresses: &[DialAddress],
    ) -> Result<Reservation, RelayError> {
        let request = HopRequest::Reserve {
            lifetime_ms: self.inner.config.reservation_lifetime_ms,
            addresses: addresses.to_vec(),
        };
        let (_stream, response) = self.request(relay, &request).await?;
        match response {
            HopResponse::Reserved(grant) => Ok(Reservation {
                relay: relay.remote_peer(),
                relay_addr: relay.remote_addr().with_peer(relay.remote_peer()),
                grant,
                expires_at: Instant::now() + grant.lifetime(),
            }),
            HopResponse::Denied { reason } => Err(RelayError::Denied(reason)),
            other => Err(RelayError::Protocol(format!(
                "expected reservation reply, got {other:?}"
            ))),
        }
    }

    /// Reserve with a relay and keep the reservation renewed
    ///
    /// `addresses` are published to the relay's address cache.
    #[instrument(skip_all, fields(relay = %relay.remote_peer().short_id()))]
    pub async fn reserve(
        &self,
        relay: &Connection,
        addresses: Vec<DialAddress>,
    ) -> Result<Reservation, RelayError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(RelayError::Shutdown);
        }
        let reservation = self.reserve_once(relay, &addresses).await?;
        let relay_peer = relay.remote_peer();
        relay.set_keep_alive(true);

        let cancel = self.inner.shutdown.child_token();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let previous = self.inner.reservations.insert(
            relay_peer,
            HeldReservation {
                reservation: reservation.clone(),
                conn: relay.clone(),
                addresses,
                generation,
                cancel: cancel.clone(),
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
        }

        info!(
            lifetime_ms = reservation.grant.lifetime_ms,
            max_circuits = reservation.grant.max_circuits,
            "Reservation held"
        );
        let _ = self.inner.events.send(RelayEvent::Reserved { relay: relay_peer });

        let client = self.clone();
        self.inner
            .tasks
            .spawn(async move { client.renewal_loop(relay_peer, generation, cancel).await });
        Ok(reservation)
    }

    async fn renewal_loop(&self, relay: PeerId, generation: u64, cancel: CancellationToken) {
        loop {
            let Some((conn, granted)) = self
                .inner
                .reservations
                .get(&relay)
                .map(|held| (held.conn.clone(), held.reservation.grant.lifetime()))
            else {
                return;
            };

            // Up to a tenth early so renewals spread out
            let wait = self.inner.config.renew_after(granted);
            let jitter_ms = (wait.as_millis() as u64) / 10;
            let jitter = Duration::from_millis(rand::random_range(0..=jitter_ms));
            let wait = wait.saturating_sub(jitter);
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
                // A dead relay connection means renewal can start failing now
                _ = conn.closed() => {}
            }

            let mut failures = 0;
            loop {
                let Some((conn, addresses)) = self
                    .inner
                    .reservations
                    .get(&relay)
                    .map(|held| (held.conn.clone(), held.addresses.clone()))
                else {
                    return;
                };

                match self.reserve_once(&conn, &addresses).await {
                    Ok(reservation) => {
                        if let Some(mut held) = self.inner.reservations.get_mut(&relay) {
                            held.reservation = reservation;
                        }
                        debug!(relay = %relay.short_id(), "Reservation renewed");
                        let _ = self.inner.events.send(RelayEvent::Renewed { relay });
                        break;
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(
                            relay = %relay.short_id(),
                            failures,
                            error = %e,
                            "Reservation renewal failed"
                        );
                        if failures >= self.inner.config.max_renewal_failures {
                            self.lose(&relay, generation);
                            return;
                        }
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.inner.config.renewal_retry()) => {}
                }
            }
        }
    }

    /// Drop a reservation after renewal gave up and degrade its circuits
    fn lose(&self, relay: &PeerId, generation: u64) {
        let removed = self
            .inner
            .reservations
            .remove_if(relay, |_, held| held.generation == generation);
        if let Some((_, held)) = removed {
            held.conn.set_keep_alive(false);
        }
        let degraded = self.inner.lifecycle.mark_degraded(relay);
        warn!(
            relay = %relay.short_id(),
            degraded,
            "Reservation lost, circuits through relay degraded"
        );
        let _ = self
            .inner
            .events
            .send(RelayEvent::ReservationLost { relay: *relay, degraded });
    }

    /// Give up a reservation voluntarily
    pub fn release(&self, relay: &PeerId) {
        if let Some((_, held)) = self.inner.reservations.remove(relay) {
            held.cancel.cancel();
            held.conn.set_keep_alive(false);
            debug!(relay = %relay.short_id(), "Reservation released");
        }
    }

    /// Ask a relay what it has cached for `target`
    ///
    /// `None` means unknown, not unreachable.
    pub async fn query_address(
        &self,
        relay: &Connection,
        target: PeerId,
    ) -> Result<Option<AddressRecord>, RelayError> {
        let (_stream, response) = self
            .request(relay, &HopRequest::QueryAddress { target })
            .await?;
        match response {
            HopResponse::Address { record } => {
                Ok(record.filter(|r| r.peer == target && !r.addresses.is_empty()))
            }
            HopResponse::Denied { reason } => Err(RelayError::Denied(reason)),
            other => Err(RelayError::Protocol(format!(
                "expected address reply, got {other:?}"
            ))),
        }
    }

    /// Open a circuit to `target` through `relay`
    ///
    /// The circuit carries only the category `protocol` belongs to. The
    /// returned path is authenticated and ready to register; nothing is
    /// exposed if the deadline passes first.
    #[instrument(skip_all, fields(relay = %relay.remote_peer().short_id(), target = %target.short_id(), protocol = %protocol))]
    pub async fn open_circuit(
        &self,
        relay: &Connection,
        target: PeerId,
        protocol: &str,
        deadline: Instant,
    ) -> Result<ConnectionPath, RelayError> {
        tokio::select! {
            result = tokio::time::timeout_at(deadline, self.open_circuit_inner(relay, target, protocol)) => {
                result.map_err(|_| RelayError::Timeout)?
            }
            _ = self.inner.shutdown.cancelled() => Err(RelayError::Shutdown),
        }
    }

    async fn open_circuit_inner(
        &self,
        relay: &Connection,
        target: PeerId,
        protocol: &str,
    ) -> Result<ConnectionPath, RelayError> {
        let category = ProtocolCategory::of(protocol);
        let request = HopRequest::Connect {
            target,
            category,
            protocol: protocol.to_string(),
        };
        let (stream, response) = self.request(relay, &request).await?;
        match response {
            HopResponse::Connected => {}
            HopResponse::Denied { reason } => {
                if reason == DenyReason::ProtocolNotPermitted {
                    error!(%category, "Relay refused circuit category");
                } else {
                    debug!(%reason, "Relay denied circuit");
                }
                return Err(RelayError::Denied(reason));
            }
            other => {
                return Err(RelayError::Protocol(format!(
                    "expected circuit reply, got {other:?}"
                )));
            }
        }

        let (io, verified) = self
            .inner
            .upgrade
            .upgrade_outbound(Box::new(stream), target)
            .await?;
        if verified != target {
            error!(
                expected = %target.short_id(),
                actual = %verified.short_id(),
                "Circuit identity mismatch"
            );
            return Err(RelayError::Upgrade(TransportError::IdentityMismatch {
                expected: target,
                actual: verified,
            }));
        }

        let relay_peer = relay.remote_peer();
        let relay_addr = relay.remote_addr().with_peer(relay_peer);
        let session = MuxSession::new(io, Role::Dialer, self.inner.mux.clone());
        debug!("Circuit secured");
        Ok(ConnectionPath::relayed(
            session,
            relay.local_addr(),
            DialAddress::circuit(&relay_addr, target),
            relay_peer,
            category,
        ))
    }

    /// Serve one inbound stop stream in the background
    pub fn handle_stop(&self, relay: Connection, stream: Stream) {
        if self.inner.shutdown.is_cancelled() {
            stream.reset();
            return;
        }
        let client = self.clone();
        self.inner.tasks.spawn(async move {
            let relay_peer = relay.remote_peer();
            if let Err(e) = client.accept_circuit(relay, stream).await {
                debug!(relay = %relay_peer.short_id(), error = %e, "Inbound circuit failed");
            }
        });
    }

    async fn accept_circuit(&self, relay: Connection, mut stream: Stream) -> Result<(), RelayError> {
        let request: StopRequest =
            tokio::time::timeout(self.inner.config.request_timeout(), read_frame(&mut stream))
                .await
                .map_err(|_| RelayError::Timeout)??;
        let StopRequest::Connect {
            source,
            category,
            protocol,
        } = request;

        let relay_peer = relay.remote_peer();
        let rejection = if !self.has_reservation(&relay_peer) {
            Some(DenyReason::NoReservation)
        } else if ProtocolCategory::of(&protocol) != category {
            error!(
                relay = %relay_peer.short_id(),
                source = %source.short_id(),
                protocol = %protocol,
                declared = %category,
                "Inbound circuit declares a protocol outside its category"
            );
            Some(DenyReason::ProtocolNotPermitted)
        } else {
            None
        };
        if let Some(reason) = rejection {
            write_frame(&mut stream, &StopResponse::Rejected { reason }).await?;
            return Err(RelayError::Denied(reason));
        }
        write_frame(&mut stream, &StopResponse::Accepted).await?;

        let (io, verified) = self.inner.upgrade.upgrade_inbound(Box::new(stream)).await?;
        if verified != source {
            error!(
                relay = %relay_peer.short_id(),
                announced = %source.short_id(),
                actual = %verified.short_id(),
                "Inbound circuit identity does not match relay announcement"
            );
            return Err(RelayError::Upgrade(TransportError::IdentityMismatch {
                expected: source,
                actual: verified,
            }));
        }

        let relay_addr = relay.remote_addr().with_peer(relay_peer);
        let session = MuxSession::new(io, Role::Listener, self.inner.mux.clone());
        let circuit = InboundCircuit {
            peer: source,
            relay: relay_peer,
            category,
            protocol,
            path: ConnectionPath::relayed(
                session,
                relay.local_addr(),
                DialAddress::circuit(&relay_addr, source),
                relay_peer,
                category,
            ),
        };
        debug!(
            relay = %relay_peer.short_id(),
            source = %source.short_id(),
            %category,
            "Inbound circuit accepted"
        );
        if let Err(mpsc::error::SendError(circuit)) = self.inner.inbound.send(circuit).await {
            circuit.path.session.close();
            return Err(RelayError::Shutdown);
        }
        Ok(())
    }

    /// Stop renewals and release every reservation
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        let relays: Vec<PeerId> = self.inner.reservations.iter().map(|e| *e.key()).collect();
        for relay in relays {
            self.release(&relay);
        }
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}
