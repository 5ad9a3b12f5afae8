//! The node facade
//!
//! [`Node`] wires the collaborators together: one lifecycle manager owns
//! the pool, the dial coordinator establishes connections, the relay client
//! holds reservations and accepts circuits, the hole punch coordinator
//! upgrades relayed connections, and an optional relay server serves other
//! peers. Inbound streams are routed by protocol hint; control protocols
//! are handled internally and everything else is surfaced through
//! [`Node::accept_stream`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use indras_core::memory::{StaticDirectory, StaticNat};
use indras_core::{
    AddressDirectory, ConnectionEvent, DialAddress, Keypair, Listener, NatDetector, PeerId,
    ProtocolCategory, RELAY_HOP_PROTOCOL, RELAY_STOP_PROTOCOL, RawConnection, SecureUpgrade,
    SignedHandshake, Transport, is_internal,
};
use indras_holepunch::{HolePunchCoordinator, PunchState, PunchStats};
use indras_relay::{InboundCircuit, RelayClient, RelayEvent, RelayServer, Reservation};
use indras_transport::{
    Connection, ConnectionPath, LifecycleManager, MuxSession, Role, Stream, StreamHandler,
};

use crate::config::NodeConfig;
use crate::dial::{DialCoordinator, DialStats};
use crate::error::{ConnectError, NodeError, NodeResult};

/// Inbound application streams buffered before new ones are reset
const APP_STREAM_BACKLOG: usize = 256;

const MIN_PRUNE_INTERVAL: Duration = Duration::from_secs(1);

/// Routes inbound streams on pooled connections by protocol hint
struct Router {
    server: Option<RelayServer>,
    relay: RelayClient,
    app: mpsc::Sender<(Connection, Stream)>,
}

impl StreamHandler for Router {
    fn handle_stream(&self, conn: Connection, stream: Stream) {
        let protocol = stream.protocol();
        if conn.relay_peer().is_some() && is_internal(protocol) {
            error!(
                peer = %conn.remote_peer().short_id(),
                protocol,
                "Control stream arrived over an application circuit"
            );
            stream.reset();
            return;
        }

        match protocol {
            RELAY_HOP_PROTOCOL => match &self.server {
                Some(server) => server.handle_hop(conn, stream),
                None => {
                    debug!(peer = %conn.remote_peer().short_id(), "Not serving as a relay");
                    stream.reset();
                }
            },
            RELAY_STOP_PROTOCOL => self.relay.handle_stop(conn, stream),
            other if is_internal(other) => {
                debug!(protocol = other, "Unexpected control stream");
                stream.reset();
            }
            _ => {
                if let Err(e) = self.app.try_send((conn, stream)) {
                    let (conn, stream) = e.into_inner();
                    warn!(
                        peer = %conn.remote_peer().short_id(),
                        protocol = stream.protocol(),
                        "Application stream backlog full"
                    );
                    stream.reset();
                }
            }
        }
    }
}

/// Builds a [`Node`]
pub struct NodeBuilder {
    keypair: Keypair,
    transport: Arc<dyn Transport>,
    config: NodeConfig,
    directory: Option<Arc<dyn AddressDirectory>>,
    nat: Option<Arc<dyn NatDetector>>,
    upgrade: Option<Arc<dyn SecureUpgrade>>,
}

impl NodeBuilder {
    /// `transport` must authenticate as `keypair`'s identity
    pub fn new(keypair: Keypair, transport: Arc<dyn Transport>) -> Self {
        Self {
            keypair,
            transport,
            config: NodeConfig::default(),
            directory: None,
            nat: None,
            upgrade: None,
        }
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// Where candidate addresses come from. Defaults to an empty table.
    pub fn directory(mut self, directory: Arc<dyn AddressDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// NAT classification source. Defaults to "unknown" for everyone.
    pub fn nat(mut self, nat: Arc<dyn NatDetector>) -> Self {
        self.nat = Some(nat);
        self
    }

    /// Identity proof run over relay circuits. Defaults to [`SignedHandshake`].
    pub fn upgrade(mut self, upgrade: Arc<dyn SecureUpgrade>) -> Self {
        self.upgrade = Some(upgrade);
        self
    }

    /// Assemble the node. Requires a tokio runtime.
    pub fn build(self) -> NodeResult<Node> {
        let local = self.keypair.peer_id();
        if self.transport.local_peer() != local {
            return Err(NodeError::Config(format!(
                "transport authenticates as {}, keypair is {}",
                self.transport.local_peer().short_id(),
                local.short_id()
            )));
        }

        let config = self.config;
        let directory = self
            .directory
            .unwrap_or_else(|| Arc::new(StaticDirectory::new()));
        let nat = self
            .nat
            .unwrap_or_else(|| Arc::new(StaticNat::default()));
        let upgrade = self
            .upgrade
            .unwrap_or_else(|| Arc::new(SignedHandshake::new(self.keypair)));

        let lifecycle = LifecycleManager::new(config.lifecycle.clone());
        let (relay, circuits) = RelayClient::new(
            local,
            upgrade,
            lifecycle.clone(),
            config.mux.clone(),
            config.relay.clone(),
        );
        let server = config
            .relay_server
            .clone()
            .map(|server| RelayServer::new(local, server));
        let holepunch = HolePunchCoordinator::new(
            local,
            config.holepunch.clone(),
            self.transport.clone(),
            nat,
            relay.clone(),
            lifecycle.clone(),
            config.mux.clone(),
        );
        let dialer = DialCoordinator::new(
            config.dial.clone(),
            config.mux.clone(),
            self.transport.clone(),
            directory,
            lifecycle.clone(),
            relay.clone(),
            holepunch.clone(),
        );

        let (app_tx, app_rx) = mpsc::channel(APP_STREAM_BACKLOG);
        lifecycle.set_stream_handler(Arc::new(Router {
            server: server.clone(),
            relay: relay.clone(),
            app: app_tx,
        }));

        let inner = Arc::new(NodeInner {
            local,
            config,
            transport: self.transport,
            lifecycle,
            relay,
            server,
            holepunch,
            dialer,
            app_streams: Mutex::new(app_rx),
            listen_addrs: RwLock::new(Vec::new()),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });

        inner.tasks.spawn(circuit_loop(
            Arc::downgrade(&inner),
            circuits,
            inner.shutdown.clone(),
        ));
        inner.tasks.spawn(supervise_relays(
            Arc::downgrade(&inner),
            inner.relay.subscribe(),
            inner.shutdown.clone(),
        ));

        info!(peer = %local.short_id(), relay = inner.server.is_some(), "Node created");
        Ok(Node { inner })
    }
}

struct NodeInner {
    local: PeerId,
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    lifecycle: LifecycleManager,
    relay: RelayClient,
    server: Option<RelayServer>,
    holepunch: HolePunchCoordinator,
    dialer: DialCoordinator,
    app_streams: Mutex<mpsc::Receiver<(Connection, Stream)>>,
    listen_addrs: RwLock<Vec<DialAddress>>,
    started: AtomicBool,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl NodeInner {
    fn handle_inbound(&self, raw: RawConnection) {
        let peer = raw.remote_peer;
        let session = MuxSession::new(raw.io, Role::Listener, self.config.mux.clone());
        let path = ConnectionPath::direct(session, raw.local_addr, raw.remote_addr);
        let Some(path) = self.holepunch.offer_inbound(peer, path) else {
            return;
        };

        // A direct dial from a peer we only reach through a relay upgrades that connection
        let result = match self.lifecycle.primary(&peer) {
            Some(primary) if primary.relay_peer().is_some() => {
                self.lifecycle.upgrade(&primary, path).map(|()| primary)
            }
            _ => self.lifecycle.register(Connection::new(peer, path)),
        };
        if let Err(e) = result {
            debug!(peer = %peer.short_id(), error = %e, "Inbound connection dropped");
        }
    }

    fn handle_circuit(&self, circuit: InboundCircuit) {
        match circuit.category {
            ProtocolCategory::Control => self.holepunch.respond(circuit),
            ProtocolCategory::Application => {
                let peer = circuit.peer;
                if let Err(e) = self.lifecycle.register(Connection::new(peer, circuit.path)) {
                    debug!(peer = %peer.short_id(), error = %e, "Inbound circuit dropped");
                }
            }
        }
    }

    fn listen_addrs(&self) -> Vec<DialAddress> {
        self.listen_addrs.read().clone()
    }

    /// Reserve with the relay at `relay_addr`, connecting to it first if needed
    async fn reserve(&self, relay_addr: &DialAddress) -> NodeResult<Reservation> {
        let relay = relay_addr.peer_id().ok_or_else(|| {
            NodeError::Config(format!("relay address {relay_addr} does not name the relay"))
        })?;
        self.dialer
            .address_book()
            .insert_unverified(relay, std::slice::from_ref(relay_addr));
        let deadline =
            Instant::now() + self.config.dial.dial_timeout() + self.config.relay.request_timeout();
        let conn = self.dialer.connect(relay, deadline).await?;
        let reservation = self.relay.reserve(&conn, self.listen_addrs()).await?;
        Ok(reservation)
    }
}

/// A peer in the Indras connectivity overlay
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn builder(keypair: Keypair, transport: Arc<dyn Transport>) -> NodeBuilder {
        NodeBuilder::new(keypair, transport)
    }

    pub fn local_peer(&self) -> PeerId {
        self.inner.local
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Bind the configured listen addresses and reserve with the configured relays
    ///
    /// A relay that cannot be reached is logged and skipped.
    #[instrument(skip(self), fields(peer = %self.inner.local.short_id()))]
    pub async fn start(&self) -> NodeResult<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(NodeError::AlreadyStarted);
        }
        for addr in self.inner.config.listen.clone() {
            self.listen(&addr).await?;
        }
        for relay_addr in self.inner.config.relay.relays.clone() {
            if let Err(e) = self.reserve(&relay_addr).await {
                warn!(relay = %relay_addr, error = %e, "Could not reserve with relay");
            }
        }
        info!(
            listen = self.inner.listen_addrs.read().len(),
            reservations = self.inner.relay.reservations().len(),
            "Node started"
        );
        Ok(())
    }

    /// Accept inbound connections on `addr`. Returns the bound address.
    pub async fn listen(&self, addr: &DialAddress) -> NodeResult<DialAddress> {
        if self.inner.shutdown.is_cancelled() {
            return Err(NodeError::Shutdown);
        }
        let listener = self.inner.transport.listen(addr).await?;
        let bound = listener.local_addr().clone();
        self.inner.listen_addrs.write().push(bound.clone());
        self.inner
            .holepunch
            .set_advertised_addresses(self.inner.listen_addrs());
        self.inner.tasks.spawn(accept_loop(
            Arc::downgrade(&self.inner),
            listener,
            self.inner.shutdown.clone(),
        ));
        info!(addr = %bound, "Listening");
        Ok(bound)
    }

    pub fn listen_addrs(&self) -> Vec<DialAddress> {
        self.inner.listen_addrs()
    }

    /// Relay-qualified addresses backed by current reservations
    pub fn circuit_addrs(&self) -> Vec<DialAddress> {
        self.inner.relay.circuit_addresses()
    }

    /// Everything another peer could dial to reach us
    pub fn addresses(&self) -> Vec<DialAddress> {
        let mut addrs = self.listen_addrs();
        addrs.extend(self.circuit_addrs());
        addrs
    }

    /// Connect to `peer` by identity
    ///
    /// Returns an existing healthy connection when there is one. Concurrent
    /// calls for the same peer share one attempt.
    pub async fn connect(&self, peer: PeerId, deadline: Instant) -> Result<Connection, ConnectError> {
        self.inner.dialer.connect(peer, deadline).await
    }

    /// Like [`connect`](Self::connect), also abandoned when `cancel` fires
    pub async fn connect_with_cancel(
        &self,
        peer: PeerId,
        deadline: Instant,
        cancel: CancellationToken,
    ) -> Result<Connection, ConnectError> {
        self.inner
            .dialer
            .connect_with_cancel(peer, deadline, cancel)
            .await
    }

    /// Open a stream for `protocol` on an established connection
    pub async fn open_stream(&self, conn: &Connection, protocol: &str) -> NodeResult<Stream> {
        Ok(conn.open_stream(protocol).await?)
    }

    /// Next inbound application stream; `None` after shutdown
    pub async fn accept_stream(&self) -> Option<(Connection, Stream)> {
        let mut streams = self.inner.app_streams.lock().await;
        tokio::select! {
            next = streams.recv() => next,
            _ = self.inner.shutdown.cancelled() => None,
        }
    }

    /// Connection lifecycle notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.lifecycle.subscribe()
    }

    /// Reservation notifications
    pub fn relay_events(&self) -> broadcast::Receiver<RelayEvent> {
        self.inner.relay.subscribe()
    }

    pub fn close(&self, conn: &Connection) {
        self.inner.lifecycle.close(conn);
    }

    /// Every live connection to `peer`, primaries first
    pub fn connections(&self, peer: &PeerId) -> Vec<Connection> {
        self.inner.lifecycle.connections(peer)
    }

    pub fn all_connections(&self) -> Vec<Connection> {
        self.inner.lifecycle.all_connections()
    }

    /// The connection [`connect`](Self::connect) would return right now
    pub fn primary(&self, peer: &PeerId) -> Option<Connection> {
        self.inner.lifecycle.primary(peer)
    }

    /// Reserve with a relay. `relay_addr` must name the relay's identity.
    #[instrument(skip(self), fields(relay = %relay_addr))]
    pub async fn reserve(&self, relay_addr: &DialAddress) -> NodeResult<Reservation> {
        let reservation = self.inner.reserve(relay_addr).await?;
        info!(
            circuit = %reservation.circuit_address(self.inner.local),
            "Reservation acquired"
        );
        Ok(reservation)
    }

    pub fn reservations(&self) -> Vec<Reservation> {
        self.inner.relay.reservations()
    }

    pub fn punch_state(&self, peer: &PeerId) -> PunchState {
        self.inner.holepunch.state(peer)
    }

    pub fn punch_stats(&self) -> PunchStats {
        self.inner.holepunch.stats()
    }

    pub fn dial_stats(&self) -> DialStats {
        self.inner.dialer.stats()
    }

    pub fn dialer(&self) -> &DialCoordinator {
        &self.inner.dialer
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.inner.lifecycle
    }

    pub fn relay_client(&self) -> &RelayClient {
        &self.inner.relay
    }

    /// The relay this node serves, if configured
    pub fn relay_server(&self) -> Option<&RelayServer> {
        self.inner.server.as_ref()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop every background task and close every connection
    #[instrument(skip(self), fields(peer = %self.inner.local.short_id()))]
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!("Shutting down node");
        self.inner.shutdown.cancel();
        self.inner.dialer.shutdown().await;
        self.inner.holepunch.shutdown().await;
        self.inner.relay.shutdown().await;
        if let Some(server) = &self.inner.server {
            server.shutdown().await;
        }
        self.inner.lifecycle.shutdown().await;
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        info!("Node stopped");
    }
}

async fn accept_loop(node: Weak<NodeInner>, mut listener: Listener, shutdown: CancellationToken) {
    let addr = listener.local_addr().clone();
    loop {
        let raw = tokio::select! {
            raw = listener.accept() => raw,
            _ = shutdown.cancelled() => break,
        };
        let (Some(raw), Some(node)) = (raw, node.upgrade()) else {
            break;
        };
        node.handle_inbound(raw);
    }
    debug!(addr = %addr, "Accept loop stopped");
}

async fn circuit_loop(
    node: Weak<NodeInner>,
    mut circuits: mpsc::Receiver<InboundCircuit>,
    shutdown: CancellationToken,
) {
    loop {
        let circuit = tokio::select! {
            circuit = circuits.recv() => circuit,
            _ = shutdown.cancelled() => break,
        };
        let (Some(circuit), Some(node)) = (circuit, node.upgrade()) else {
            break;
        };
        node.handle_circuit(circuit);
    }
}

/// Seek a replacement when a reservation is lost and keep the address book trim
async fn supervise_relays(
    node: Weak<NodeInner>,
    mut events: broadcast::Receiver<RelayEvent>,
    shutdown: CancellationToken,
) {
    let prune_every = match node.upgrade() {
        Some(node) => node.config.dial.address_ttl().max(MIN_PRUNE_INTERVAL),
        None => return,
    };
    let mut prune = tokio::time::interval(prune_every);
    prune.tick().await;

    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = prune.tick() => {
                if let Some(node) = node.upgrade() {
                    node.dialer.address_book().prune();
                }
                continue;
            }
            _ = shutdown.cancelled() => break,
        };
        let lost = match event {
            Ok(RelayEvent::ReservationLost { relay, degraded }) => {
                warn!(relay = %relay.short_id(), degraded, "Reservation lost, seeking a replacement");
                relay
            }
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Relay events lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(node) = node.upgrade() else {
            break;
        };

        // Other configured relays first, the lost one as a last resort
        let mut candidates: Vec<DialAddress> = node
            .config
            .relay
            .relays
            .iter()
            .filter(|addr| {
                addr.peer_id()
                    .is_some_and(|relay| !node.relay.has_reservation(&relay))
            })
            .cloned()
            .collect();
        candidates.sort_by_key(|addr| addr.peer_id() == Some(lost));

        let mut replaced = false;
        for addr in candidates {
            let attempt = tokio::select! {
                result = node.reserve(&addr) => result,
                _ = shutdown.cancelled() => return,
            };
            match attempt {
                Ok(reservation) => {
                    info!(relay = %reservation.relay.short_id(), "Replacement reservation acquired");
                    replaced = true;
                    break;
                }
                Err(e) => debug!(relay = %addr, error = %e, "Replacement relay failed"),
            }
        }
        if !replaced {
            warn!(relay = %lost.short_id(), "No replacement relay available");
        }
    }
}
