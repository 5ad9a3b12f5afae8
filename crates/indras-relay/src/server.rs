//! Relay server
//!
//! Serves the hop protocol for connected clients:
//!
//! - reservations, bounded in count and lifetime, with per-reservation
//!   circuit and byte limits
//! - a best-effort address cache fed by reservation requests
//! - circuit forwarding between a source and a reserved target, splicing the
//!   source's hop stream onto a stop stream opened towards the target
//!
//! The category policy is enforced before any forwarding state is created:
//! a circuit declares one traffic category and protocol, and the relay
//! refuses categories it is not configured to serve as well as protocols
//! that do not belong to the declared category.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use indras_core::codec::{read_frame, write_frame};
use indras_core::{DialAddress, PeerId, ProtocolCategory, RELAY_STOP_PROTOCOL};
use indras_transport::{Connection, Stream};

use crate::address_cache::AddressCache;
use crate::config::RelayServerConfig;
use crate::error::{DenyReason, RelayError};
use crate::protocol::{HopRequest, HopResponse, ReservationGrant, StopRequest, StopResponse};

const SPLICE_BUFFER: usize = 16 * 1024;

struct ServedReservation {
    peer: PeerId,
    conn: Connection,
    grant: ReservationGrant,
    expires_at: Mutex<Instant>,
    circuits: AtomicU32,
    bytes_used: AtomicU64,
    revoked: CancellationToken,
}

impl ServedReservation {
    fn is_expired(&self) -> bool {
        Instant::now() >= *self.expires_at.lock()
    }
}

/// Releases a circuit slot on drop
struct CircuitSlot(Arc<ServedReservation>);

impl Drop for CircuitSlot {
    fn drop(&mut self) {
        self.0.circuits.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Why a spliced circuit stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitEnd {
    Completed,
    ByteLimit,
    DurationLimit,
    QuotaExhausted,
    Revoked,
    Shutdown,
    Io,
}

/// Snapshot of relay activity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayServerStats {
    pub reservations: usize,
    pub active_circuits: u64,
    pub circuits_opened: u64,
    pub circuits_denied: u64,
    pub bytes_relayed: u64,
}

struct ServerInner {
    local: PeerId,
    config: RelayServerConfig,
    reservations: dashmap::DashMap<PeerId, Arc<ServedReservation>>,
    cache: AddressCache,
    active_circuits: AtomicU64,
    circuits_opened: AtomicU64,
    circuits_denied: AtomicU64,
    bytes_relayed: AtomicU64,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Relay service attached to a node's inbound hop streams
#[derive(Clone)]
pub struct RelayServer {
    inner: Arc<ServerInner>,
}

impl RelayServer {
    /// Create a relay and start its sweeper. Requires a tokio runtime.
    pub fn new(local: PeerId, config: RelayServerConfig) -> Self {
        let inner = Arc::new(ServerInner {
            local,
            cache: AddressCache::new(config.address_cache_ttl(), config.address_cache_capacity),
            reservations: dashmap::DashMap::new(),
            active_circuits: AtomicU64::new(0),
            circuits_opened: AtomicU64::new(0),
            circuits_denied: AtomicU64::new(0),
            bytes_relayed: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            config,
        });
        let server = Self { inner };

        let sweeper = server.clone();
        server.inner.tasks.spawn(async move { sweeper.sweep_loop().await });
        server
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.local
    }

    pub fn config(&self) -> &RelayServerConfig {
        &self.inner.config
    }

    pub fn address_cache(&self) -> &AddressCache {
        &self.inner.cache
    }

    pub fn has_reservation(&self, peer: &PeerId) -> bool {
        self.inner
            .reservations
            .get(peer)
            .map(|r| !r.is_expired())
            .unwrap_or(false)
    }

    pub fn reserved_peers(&self) -> Vec<PeerId> {
        self.inner.reservations.iter().map(|e| *e.key()).collect()
    }

    pub fn stats(&self) -> RelayServerStats {
        RelayServerStats {
            reservations: self.inner.reservations.len(),
            active_circuits: self.inner.active_circuits.load(Ordering::Relaxed),
            circuits_opened: self.inner.circuits_opened.load(Ordering::Relaxed),
            circuits_denied: self.inner.circuits_denied.load(Ordering::Relaxed),
            bytes_relayed: self.inner.bytes_relayed.load(Ordering::Relaxed),
        }
    }

    /// Serve one inbound hop stream in the background
    pub fn handle_hop(&self, conn: Connection, stream: Stream) {
        if self.inner.shutdown.is_cancelled() {
            stream.reset();
            return;
        }
        let server = self.clone();
        self.inner.tasks.spawn(async move {
            if let Err(e) = server.serve_hop(conn, stream).await {
                debug!(error = %e, "Hop stream ended with error");
            }
        });
    }

    async fn serve_hop(&self, conn: Connection, mut stream: Stream) -> Result<(), RelayError> {
        let request: HopRequest =
            tokio::time::timeout(self.inner.config.request_timeout(), read_frame(&mut stream))
                .await
                .map_err(|_| RelayError::Timeout)??;

        match request {
            HopRequest::Reserve {
                lifetime_ms,
                addresses,
            } => {
                let response = match self.reserve(&conn, lifetime_ms, addresses) {
                    Ok(grant) => HopResponse::Reserved(grant),
                    Err(reason) => HopResponse::Denied { reason },
                };
                write_frame(&mut stream, &response).await?;
            }
            HopRequest::QueryAddress { target } => {
                let record = self.inner.cache.get(&target);
                debug!(
                    from = %conn.remote_peer().short_id(),
                    target = %target.short_id(),
                    hit = record.is_some(),
                    "Address query"
                );
                write_frame(&mut stream, &HopResponse::Address { record }).await?;
            }
            HopRequest::Connect {
                target,
                category,
                protocol,
            } => {
                self.connect(conn.remote_peer(), stream, target, category, protocol)
                    .await?;
            }
        }
        Ok(())
    }

    fn reserve(
        &self,
        conn: &Connection,
        lifetime_ms: u64,
        addresses: Vec<DialAddress>,
    ) -> Result<ReservationGrant, DenyReason> {
        let config = &self.inner.config;
        let peer = conn.remote_peer();
        let lifetime_ms = lifetime_ms.min(config.max_reservation_ttl_ms).max(1);
        let expires_at = Instant::now() + std::time::Duration::from_millis(lifetime_ms);

        // Renewal over the same connection keeps counters and circuits
        if let Some(existing) = self.inner.reservations.get(&peer) {
            if existing.conn == *conn && !existing.revoked.is_cancelled() {
                *existing.expires_at.lock() = expires_at;
                self.inner.cache.insert(peer, addresses);
                debug!(peer = %peer.short_id(), lifetime_ms, "Reservation renewed");
                return Ok(ReservationGrant {
                    lifetime_ms,
                    ..existing.grant
                });
            }
        }

        if !self.inner.reservations.contains_key(&peer)
            && self.inner.reservations.len() >= config.max_reservations
        {
            warn!(
                peer = %peer.short_id(),
                max = config.max_reservations,
                "Reservation limit reached"
            );
            return Err(DenyReason::ResourceLimit);
        }

        let grant = ReservationGrant {
            lifetime_ms,
            max_circuits: config.max_circuits_per_reservation,
            max_circuit_bytes: config.max_circuit_bytes,
            max_circuit_duration_ms: config.max_circuit_duration_ms,
            byte_quota: config.reservation_byte_quota,
        };
        let reservation = Arc::new(ServedReservation {
            peer,
            conn: conn.clone(),
            grant,
            expires_at: Mutex::new(expires_at),
            circuits: AtomicU32::new(0),
            bytes_used: AtomicU64::new(0),
            revoked: CancellationToken::new(),
        });
        conn.set_keep_alive(true);
        if let Some(old) = self.inner.reservations.insert(peer, reservation) {
            // The client reconnected; circuits over the old connection are gone
            old.revoked.cancel();
            if old.conn != *conn {
                old.conn.set_keep_alive(false);
            }
        }
        self.inner.cache.insert(peer, addresses);

        info!(peer = %peer.short_id(), lifetime_ms, "Reservation granted");
        Ok(grant)
    }

    fn lookup_reservation(&self, target: &PeerId) -> Result<Arc<ServedReservation>, DenyReason> {
        let reservation = self
            .inner
            .reservations
            .get(target)
            .map(|r| r.clone())
            .ok_or(DenyReason::NoReservation)?;
        if reservation.revoked.is_cancelled() {
            return Err(DenyReason::NoReservation);
        }
        if reservation.is_expired() {
            self.revoke(&reservation, "expired");
            return Err(DenyReason::ReservationExpired);
        }
        if reservation.conn.is_closed() {
            self.revoke(&reservation, "connection closed");
            return Err(DenyReason::TargetUnreachable);
        }
        Ok(reservation)
    }

    async fn deny(&self, stream: &mut Stream, reason: DenyReason) -> Result<(), RelayError> {
        self.inner.circuits_denied.fetch_add(1, Ordering::Relaxed);
        write_frame(stream, &HopResponse::Denied { reason }).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(source = %source.short_id(), target = %target.short_id(), %category))]
    async fn connect(
        &self,
        source: PeerId,
        mut stream: Stream,
        target: PeerId,
        category: ProtocolCategory,
        protocol: String,
    ) -> Result<(), RelayError> {
        if ProtocolCategory::of(&protocol) != category || !self.inner.config.serves(category) {
            error!(
                protocol = %protocol,
                declared = %category,
                "Rejected circuit outside permitted protocol category"
            );
            return self.deny(&mut stream, DenyReason::ProtocolNotPermitted).await;
        }

        let reservation = match self.lookup_reservation(&target) {
            Ok(r) => r,
            Err(reason) => {
                debug!(%reason, "Circuit denied");
                return self.deny(&mut stream, reason).await;
            }
        };

        let slots = reservation.circuits.fetch_add(1, Ordering::SeqCst);
        let _slot = CircuitSlot(reservation.clone());
        if slots >= reservation.grant.max_circuits {
            warn!(max = reservation.grant.max_circuits, "Circuit limit reached");
            return self.deny(&mut stream, DenyReason::ResourceLimit).await;
        }

        let mut stop = match self.open_stop(&reservation, source, category, protocol).await {
            Ok(stop) => stop,
            Err(reason) => {
                debug!(%reason, "Target refused circuit");
                return self.deny(&mut stream, reason).await;
            }
        };

        if let Err(e) = write_frame(&mut stream, &HopResponse::Connected).await {
            stop.reset();
            return Err(e.into());
        }

        self.inner.circuits_opened.fetch_add(1, Ordering::Relaxed);
        self.inner.active_circuits.fetch_add(1, Ordering::Relaxed);
        info!("Circuit opened");
        let end = self.splice(stream, stop, &reservation).await;
        self.inner.active_circuits.fetch_sub(1, Ordering::Relaxed);
        info!(end = ?end, "Circuit closed");

        if end == CircuitEnd::QuotaExhausted {
            self.revoke(&reservation, "byte quota exhausted");
        }
        Ok(())
    }

    async fn open_stop(
        &self,
        reservation: &ServedReservation,
        source: PeerId,
        category: ProtocolCategory,
        protocol: String,
    ) -> Result<Stream, DenyReason> {
        let mut stop = reservation
            .conn
            .open_stream(RELAY_STOP_PROTOCOL)
            .await
            .map_err(|_| DenyReason::TargetUnreachable)?;

        let exchange = async {
            write_frame(
                &mut stop,
                &StopRequest::Connect {
                    source,
                    category,
                    protocol,
                },
            )
            .await?;
            read_frame::<_, StopResponse>(&mut stop).await
        };
        let response = tokio::time::timeout(self.inner.config.request_timeout(), exchange).await;

        match response {
            Ok(Ok(StopResponse::Accepted)) => Ok(stop),
            Ok(Ok(StopResponse::Rejected { reason })) => {
                debug!(%reason, "Target rejected circuit");
                Err(DenyReason::TargetRejected)
            }
            Ok(Err(_)) | Err(_) => {
                stop.reset();
                Err(DenyReason::TargetUnreachable)
            }
        }
    }

    async fn splice(&self, source: Stream, target: Stream, res: &Arc<ServedReservation>) -> CircuitEnd {
        let (mut source_rx, mut source_tx) = tokio::io::split(source);
        let (mut target_rx, mut target_tx) = tokio::io::split(target);
        let circuit_bytes = AtomicU64::new(0);

        let end = {
            let forward = pump(&mut source_rx, &mut target_tx, &circuit_bytes, res, &self.inner);
            let backward = pump(&mut target_rx, &mut source_tx, &circuit_bytes, res, &self.inner);
            let both = async {
                match tokio::try_join!(forward, backward) {
                    Ok(_) => CircuitEnd::Completed,
                    Err(end) => end,
                }
            };

            tokio::select! {
                end = both => end,
                _ = tokio::time::sleep(res.grant.max_circuit_duration()) => CircuitEnd::DurationLimit,
                _ = res.revoked.cancelled() => CircuitEnd::Revoked,
                _ = self.inner.shutdown.cancelled() => CircuitEnd::Shutdown,
            }
        };

        if end != CircuitEnd::Completed {
            source_rx.unsplit(source_tx).reset();
            target_rx.unsplit(target_tx).reset();
        }
        end
    }

    /// Drop a reservation and tear down its circuits
    fn revoke(&self, reservation: &Arc<ServedReservation>, why: &str) {
        let removed = self
            .inner
            .reservations
            .remove_if(&reservation.peer, |_, current| Arc::ptr_eq(current, reservation))
            .is_some();
        reservation.revoked.cancel();
        reservation.conn.set_keep_alive(false);
        if removed {
            self.inner.cache.remove(&reservation.peer);
            warn!(peer = %reservation.peer.short_id(), reason = why, "Reservation revoked");
        }
    }

    /// Drop expired reservations and stale cache entries
    pub fn sweep(&self) -> usize {
        let expired: Vec<_> = self
            .inner
            .reservations
            .iter()
            .filter(|e| e.value().is_expired() || e.value().conn.is_closed())
            .map(|e| e.value().clone())
            .collect();
        for reservation in &expired {
            self.revoke(reservation, "expired");
        }
        self.inner.cache.prune();
        expired.len()
    }

    async fn sweep_loop(&self) {
        let mut ticker = tokio::time::interval(self.inner.config.sweep_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let swept = self.sweep();
                    if swept > 0 {
                        debug!(swept, "Swept expired reservations");
                    }
                }
            }
        }
    }

    /// Revoke every reservation, close every circuit, and wait for relay tasks
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!(
            reservations = self.inner.reservations.len(),
            "Shutting down relay"
        );
        self.inner.shutdown.cancel();
        let all: Vec<_> = self
            .inner
            .reservations
            .iter()
            .map(|e| e.value().clone())
            .collect();
        for reservation in &all {
            self.revoke(reservation, "relay shutdown");
        }
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}

/// Copy one direction of a circuit, enforcing byte limits
async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    circuit_bytes: &AtomicU64,
    res: &ServedReservation,
    server: &ServerInner,
) -> Result<(), CircuitEnd>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; SPLICE_BUFFER];
    loop {
        let n = reader.read(&mut buf).await.map_err(|_| CircuitEnd::Io)?;
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(());
        }
        let n64 = n as u64;
        if circuit_bytes.fetch_add(n64, Ordering::Relaxed) + n64 > res.grant.max_circuit_bytes {
            return Err(CircuitEnd::ByteLimit);
        }
        if res.bytes_used.fetch_add(n64, Ordering::Relaxed) + n64 > res.grant.byte_quota {
            return Err(CircuitEnd::QuotaExhausted);
        }
        writer
            .write_all(&buf[..n])
            .await
            .map_err(|_| CircuitEnd::Io)?;
        server.bytes_relayed.fetch_add(n64, Ordering::Relaxed);
    }
}
