//! Relay integration tests
//!
//! Three in-memory peers: a relay R, a reserved client B, and a client A
//! that reaches B only through R.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_test::assert_ok;

use indras_core::memory::{MemoryNetwork, NatBehavior};
use indras_core::{
    DialAddress, HOLEPUNCH_PROTOCOL, Keypair, PeerId, ProtocolCategory, RELAY_HOP_PROTOCOL,
    RELAY_STOP_PROTOCOL, SecureUpgrade, SignedHandshake, Transport,
};
use indras_relay::{
    APPLICATION_CIRCUIT_PROTOCOL, DenyReason, InboundCircuit, RelayClient, RelayClientConfig,
    RelayError, RelayEvent, RelayServer, RelayServerConfig,
};
use indras_transport::{
    Connection, ConnectionPath, LifecycleConfig, LifecycleManager, MuxConfig, MuxSession, Role,
    Stream, StreamHandler,
};

struct Router {
    server: Option<RelayServer>,
    client: RelayClient,
}

impl StreamHandler for Router {
    fn handle_stream(&self, conn: Connection, stream: Stream) {
        match stream.protocol() {
            RELAY_HOP_PROTOCOL => match &self.server {
                Some(server) => server.handle_hop(conn, stream),
                None => stream.reset(),
            },
            RELAY_STOP_PROTOCOL => self.client.handle_stop(conn, stream),
            _ => {}
        }
    }
}

struct TestPeer {
    id: PeerId,
    lifecycle: LifecycleManager,
    client: RelayClient,
    server: Option<RelayServer>,
    inbound: mpsc::Receiver<InboundCircuit>,
}

fn test_peer(server: Option<RelayServerConfig>, client: RelayClientConfig) -> TestPeer {
    let keypair = Keypair::generate();
    let id = keypair.peer_id();
    let lifecycle = LifecycleManager::new(LifecycleConfig::default());
    let upgrade: Arc<dyn SecureUpgrade> = Arc::new(SignedHandshake::new(keypair));
    let (client, inbound) =
        RelayClient::new(id, upgrade, lifecycle.clone(), MuxConfig::default(), client);
    let server = server.map(|config| RelayServer::new(id, config));
    lifecycle.set_stream_handler(Arc::new(Router {
        server: server.clone(),
        client: client.clone(),
    }));
    TestPeer {
        id,
        lifecycle,
        client,
        server,
        inbound,
    }
}

/// Direct connection from `from` to `to`, registered on both sides
async fn link(net: &MemoryNetwork, from: &TestPeer, to: &TestPeer) -> (Connection, Connection) {
    let dialer = net.transport(from.id, NatBehavior::Open);
    let listener_side = net.transport(to.id, NatBehavior::Open);
    let mut listener = listener_side.listen(&DialAddress::memory(0)).await.unwrap();
    let target = listener.local_addr().clone();

    let deadline = Instant::now() + Duration::from_secs(2);
    let (dialed, accepted) = tokio::join!(dialer.dial(&target, deadline), listener.accept());
    let dialed = assert_ok!(dialed);
    let accepted = accepted.unwrap();

    let ours = from
        .lifecycle
        .register(Connection::new(
            to.id,
            ConnectionPath::direct(
                MuxSession::new(dialed.io, Role::Dialer, MuxConfig::default()),
                dialed.local_addr,
                dialed.remote_addr,
            ),
        ))
        .unwrap();
    let theirs = to
        .lifecycle
        .register(Connection::new(
            from.id,
            ConnectionPath::direct(
                MuxSession::new(accepted.io, Role::Listener, MuxConfig::default()),
                accepted.local_addr,
                accepted.remote_addr,
            ),
        ))
        .unwrap();
    (ours, theirs)
}

fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(3)
}

async fn wait_for<F: Fn() -> bool>(cond: F) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

struct Triangle {
    net: MemoryNetwork,
    relay: TestPeer,
    a: TestPeer,
    b: TestPeer,
    a_to_relay: Connection,
    b_to_relay: Connection,
}

async fn triangle(server: RelayServerConfig, b_client: RelayClientConfig) -> Triangle {
    let net = MemoryNetwork::new();
    let relay = test_peer(Some(server), RelayClientConfig::default());
    let a = test_peer(None, RelayClientConfig::default());
    let b = test_peer(None, b_client);
    let (a_to_relay, _) = link(&net, &a, &relay).await;
    let (b_to_relay, _) = link(&net, &b, &relay).await;
    Triangle {
        net,
        relay,
        a,
        b,
        a_to_relay,
        b_to_relay,
    }
}

#[tokio::test]
async fn test_circuit_carries_independent_streams() {
    let mut t = triangle(RelayServerConfig::default(), RelayClientConfig::default()).await;
    t.b.client
        .reserve(&t.b_to_relay, vec![DialAddress::memory(999)])
        .await
        .unwrap();

    let path = t
        .a
        .client
        .open_circuit(&t.a_to_relay, t.b.id, APPLICATION_CIRCUIT_PROTOCOL, deadline())
        .await
        .unwrap();
    let inbound = t.b.inbound.recv().await.unwrap();
    assert_eq!(inbound.peer, t.a.id);
    assert_eq!(inbound.relay, t.relay.id);
    assert_eq!(inbound.category, ProtocolCategory::Application);
    assert!(path.remote_addr.is_relayed());
    assert_eq!(path.relay, Some(t.relay.id));

    let at_a = Connection::new(t.b.id, path);
    let at_b = Connection::new(t.a.id, inbound.path);

    let mut slow = at_a.open_stream("/bulk/1").await.unwrap();
    let mut fast = at_a.open_stream("/chat/1").await.unwrap();
    let first = at_b.session().accept().await.unwrap();
    let second = at_b.session().accept().await.unwrap();
    let (mut slow_in, mut fast_in) = if first.protocol() == "/bulk/1" {
        (first, second)
    } else {
        (second, first)
    };
    assert_eq!(slow_in.protocol(), "/bulk/1");
    assert_eq!(fast_in.protocol(), "/chat/1");

    // Fill the slow stream well past its window without reading it
    let bulk = vec![7u8; 600 * 1024];
    let writer = tokio::spawn(async move {
        slow.write_all(&bulk).await.unwrap();
        slow.shutdown().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!writer.is_finished());

    fast.write_all(b"still moving").await.unwrap();
    let mut buf = [0u8; 12];
    tokio::time::timeout(Duration::from_secs(1), fast_in.read_exact(&mut buf))
        .await
        .expect("fast stream stalled behind slow stream")
        .unwrap();
    assert_eq!(&buf, b"still moving");

    let mut received = Vec::new();
    slow_in.read_to_end(&mut received).await.unwrap();
    assert_eq!(received.len(), 600 * 1024);
    writer.await.unwrap();
}

#[tokio::test]
async fn test_relay_enforces_category_roles() {
    let t = triangle(RelayServerConfig::control_only(), RelayClientConfig::default()).await;
    t.b.client.reserve(&t.b_to_relay, vec![]).await.unwrap();

    let denied = t
        .a
        .client
        .open_circuit(&t.a_to_relay, t.b.id, APPLICATION_CIRCUIT_PROTOCOL, deadline())
        .await
        .unwrap_err();
    assert!(matches!(
        denied,
        RelayError::Denied(DenyReason::ProtocolNotPermitted)
    ));

    let control = t
        .a
        .client
        .open_circuit(&t.a_to_relay, t.b.id, HOLEPUNCH_PROTOCOL, deadline())
        .await
        .unwrap();
    assert_eq!(control.category, Some(ProtocolCategory::Control));

    let relay = t.relay.server.clone().unwrap();
    wait_for(|| relay.stats().circuits_opened == 1).await;
    assert_eq!(relay.stats().circuits_denied, 1);
}

#[tokio::test]
async fn test_circuit_requires_reservation() {
    let t = triangle(RelayServerConfig::default(), RelayClientConfig::default()).await;
    let denied = t
        .a
        .client
        .open_circuit(&t.a_to_relay, t.b.id, APPLICATION_CIRCUIT_PROTOCOL, deadline())
        .await
        .unwrap_err();
    assert!(matches!(denied, RelayError::Denied(DenyReason::NoReservation)));
}

#[tokio::test]
async fn test_address_cache_query() {
    let t = triangle(RelayServerConfig::default(), RelayClientConfig::default()).await;
    let published = vec![DialAddress::memory(4242).with_peer(t.b.id)];
    t.b.client
        .reserve(&t.b_to_relay, published.clone())
        .await
        .unwrap();

    let record = t
        .a
        .client
        .query_address(&t.a_to_relay, t.b.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.peer, t.b.id);
    assert_eq!(record.addresses, published);

    let unknown = Keypair::generate().peer_id();
    assert!(
        t.a.client
            .query_address(&t.a_to_relay, unknown)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_quota_exhaustion_revokes_reservation() {
    let server = RelayServerConfig::default().with_reservation_byte_quota(64 * 1024);
    let mut t = triangle(server, RelayClientConfig::default()).await;
    t.b.client.reserve(&t.b_to_relay, vec![]).await.unwrap();
    let relay = t.relay.server.clone().unwrap();
    assert!(relay.has_reservation(&t.b.id));

    let path = t
        .a
        .client
        .open_circuit(&t.a_to_relay, t.b.id, APPLICATION_CIRCUIT_PROTOCOL, deadline())
        .await
        .unwrap();
    let inbound = t.b.inbound.recv().await.unwrap();
    let at_a = Connection::new(t.b.id, path);
    let at_b = Connection::new(t.a.id, inbound.path);

    let mut out = at_a.open_stream("/bulk/1").await.unwrap();
    let drain = tokio::spawn(async move {
        if let Some(mut s) = at_b.session().accept().await {
            let mut sink = Vec::new();
            let _ = s.read_to_end(&mut sink).await;
        }
        at_b
    });
    let _ = out.write_all(&vec![1u8; 256 * 1024]).await;

    wait_for(|| !relay.has_reservation(&t.b.id)).await;
    let _ = drain.await;

    let denied = t
        .a
        .client
        .open_circuit(&t.a_to_relay, t.b.id, APPLICATION_CIRCUIT_PROTOCOL, deadline())
        .await
        .unwrap_err();
    assert!(matches!(denied, RelayError::Denied(DenyReason::NoReservation)));
    drop(t.net);
}

#[tokio::test]
async fn test_renewal_failures_degrade_circuits() {
    let client = RelayClientConfig::default()
        .with_reservation_lifetime(Duration::from_millis(200))
        .with_renewal_window(Duration::from_millis(100))
        .with_renewal_retry(Duration::from_millis(20))
        .with_max_renewal_failures(2);
    let t = triangle(RelayServerConfig::default(), client).await;
    let mut events = t.b.client.subscribe();
    t.b.client.reserve(&t.b_to_relay, vec![]).await.unwrap();
    assert!(matches!(
        events.recv().await.unwrap(),
        RelayEvent::Reserved { .. }
    ));

    // A circuit through R as B sees it
    let (local, _remote) = {
        let (x, y) = tokio::io::duplex(4096);
        (
            MuxSession::new(x, Role::Dialer, MuxConfig::default()),
            MuxSession::new(y, Role::Listener, MuxConfig::default()),
        )
    };
    let circuit = t
        .b
        .lifecycle
        .register(Connection::new(
            t.a.id,
            ConnectionPath::relayed(
                local,
                DialAddress::memory(1),
                DialAddress::circuit(&DialAddress::memory(2).with_peer(t.relay.id), t.a.id),
                t.relay.id,
                ProtocolCategory::Application,
            ),
        ))
        .unwrap();

    t.relay.server.as_ref().unwrap().shutdown().await;

    let lost = tokio::time::timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await.unwrap() {
                RelayEvent::ReservationLost { relay, degraded } => break (relay, degraded),
                _ => continue,
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(lost, (t.relay.id, 1));
    assert!(circuit.is_degraded());
    assert!(!t.b.client.has_reservation(&t.relay.id));
}
