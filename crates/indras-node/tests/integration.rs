//! End-to-end connect tests over the in-memory network
//!
//! Each node gets its own simulated NAT. A shared directory plays the part
//! of discovery; relay R is an open node that serves circuits.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_test::assert_ok;
use tokio_util::sync::CancellationToken;

use indras_core::memory::{Fault, MemoryNetwork, NatBehavior, StaticDirectory, StaticNat};
use indras_core::{ConnectionRole, DialAddress, Keypair, NatType, PathKind, PeerId};
use indras_holepunch::{HolePunchConfig, PunchState};
use indras_node::{ConnectError, FailureReason, Node, NodeConfig, NodeError, Trust};
use indras_relay::RelayServerConfig;
use indras_transport::LifecycleConfig;

struct Net {
    net: MemoryNetwork,
    directory: Arc<StaticDirectory>,
}

impl Net {
    fn new() -> Self {
        indras_logging::init_testing();
        Self {
            net: MemoryNetwork::new(),
            directory: Arc::new(StaticDirectory::new()),
        }
    }

    /// Build and start a node listening on one memory port
    async fn node(
        &self,
        keypair: Keypair,
        behavior: NatBehavior,
        nat: StaticNat,
        config: NodeConfig,
    ) -> Node {
        let id = keypair.peer_id();
        let node = Node::builder(keypair, Arc::new(self.net.transport(id, behavior)))
            .config(config.with_listen(DialAddress::memory(0)))
            .directory(self.directory.clone())
            .nat(Arc::new(nat))
            .build()
            .unwrap();
        assert_ok!(node.start().await);
        node
    }

    async fn open(&self) -> Node {
        self.node(
            Keypair::generate(),
            NatBehavior::Open,
            StaticNat::new(NatType::Public),
            NodeConfig::default(),
        )
        .await
    }

    async fn relay(&self) -> Node {
        self.node(
            Keypair::generate(),
            NatBehavior::Open,
            StaticNat::new(NatType::Public),
            NodeConfig::default().with_relay_server(RelayServerConfig::default()),
        )
        .await
    }

    /// Make everything `node` can be reached at discoverable
    fn publish(&self, node: &Node) {
        self.directory.insert(node.local_peer(), node.addresses());
    }
}

fn listen_addr(node: &Node) -> DialAddress {
    node.listen_addrs()[0].clone()
}

fn port(node: &Node) -> u64 {
    listen_addr(node).memory_port().unwrap()
}

fn deadline() -> Instant {
    Instant::now() + Duration::from_secs(5)
}

async fn wait_for<F: Fn() -> bool>(cond: F) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}

async fn reserve_on(node: &Node, relay: &Node) {
    assert_ok!(node.reserve(&listen_addr(relay)).await);
    assert_eq!(node.circuit_addrs().len(), 1);
}

#[tokio::test]
async fn test_direct_connect_and_reuse() {
    let net = Net::new();
    let a = net.open().await;
    let b = net.open().await;
    net.publish(&b);

    let conn = a.connect(b.local_peer(), deadline()).await.unwrap();
    assert_eq!(conn.remote_peer(), b.local_peer());
    assert_eq!(conn.path_kind(), PathKind::Direct);
    assert_eq!(conn.role(), ConnectionRole::Primary);
    wait_for(|| b.primary(&a.local_peer()).is_some()).await;

    let again = a.connect(b.local_peer(), deadline()).await.unwrap();
    assert_eq!(again.id(), conn.id());

    let stats = a.dial_stats();
    assert_eq!(stats.chains, 1);
    assert_eq!(stats.reused, 1);
    assert_eq!(stats.direct, 1);
    assert_eq!(net.net.dial_count(port(&b)), 1);

    let entry = a
        .dialer()
        .address_book()
        .entry(&b.local_peer(), &listen_addr(&b))
        .unwrap();
    assert_eq!(entry.trust, Trust::Verified);
}

#[tokio::test]
async fn test_concurrent_connects_converge() {
    let net = Net::new();
    let a = net.open().await;
    let b = net.open().await;
    net.publish(&b);
    net.net
        .inject_fault(port(&b), Fault::Latency(Duration::from_millis(200)));

    let mut calls = Vec::new();
    for _ in 0..8 {
        let a = a.clone();
        let target = b.local_peer();
        calls.push(tokio::spawn(async move { a.connect(target, deadline()).await }));
    }
    let mut ids = Vec::new();
    for call in calls {
        ids.push(call.await.unwrap().unwrap().id());
    }

    assert!(ids.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(a.connections(&b.local_peer()).len(), 1);
    assert_eq!(net.net.dial_count(port(&b)), 1);
    let stats = a.dial_stats();
    assert_eq!(stats.chains, 1);
    assert_eq!(stats.joined + stats.reused, 7);
}

#[tokio::test]
async fn test_wrong_identity_is_rejected() {
    let net = Net::new();
    let a = net.open().await;
    let b = net.open().await;
    let c = net.open().await;

    // B is listed at C's address, without an identity component
    let misleading = listen_addr(&c).without_peer();
    net.directory.insert(b.local_peer(), vec![misleading.clone()]);

    let err = a.connect(b.local_peer(), deadline()).await.unwrap_err();
    assert_eq!(
        err,
        ConnectError::IdentityMismatch {
            expected: b.local_peer(),
            actual: c.local_peer(),
        }
    );
    assert!(a.connections(&b.local_peer()).is_empty());
    assert!(a.primary(&c.local_peer()).is_none());
    assert!(
        a.dialer()
            .address_book()
            .entry(&b.local_peer(), &misleading)
            .is_none()
    );

    // With a genuine address alongside, the genuine one wins
    net.directory
        .insert(b.local_peer(), vec![misleading, listen_addr(&b)]);
    let conn = a.connect(b.local_peer(), deadline()).await.unwrap();
    assert_eq!(conn.remote_peer(), b.local_peer());
}

#[tokio::test]
async fn test_falls_back_to_second_address() {
    let net = Net::new();
    let a = net.open().await;
    let b = net.open().await;
    let dead = DialAddress::memory(9_999);
    // The refusal lands before the genuine address answers
    net.net
        .inject_fault(port(&b), Fault::Latency(Duration::from_millis(100)));
    net.directory
        .insert(b.local_peer(), vec![dead.clone(), listen_addr(&b)]);

    let conn = a.connect(b.local_peer(), deadline()).await.unwrap();
    assert_eq!(conn.remote_addr(), listen_addr(&b).without_peer());

    let book = a.dialer().address_book();
    assert_eq!(
        book.entry(&b.local_peer(), &listen_addr(&b)).unwrap().trust,
        Trust::Verified
    );
    let dead_entry = book.entry(&b.local_peer(), &dead).unwrap();
    assert_eq!(dead_entry.trust, Trust::Unverified);
    assert_eq!(dead_entry.failures, 1);
}

#[tokio::test]
async fn test_all_failed_lists_every_address() {
    let net = Net::new();
    let a = net.open().await;
    let ghost = Keypair::generate().peer_id();
    let refused = DialAddress::memory(9_001);
    let unreachable = DialAddress::memory(9_002);
    net.net.inject_fault(9_002, Fault::Unreachable);
    net.directory
        .insert(ghost, vec![refused.clone(), unreachable.clone()]);

    let err = a.connect(ghost, deadline()).await.unwrap_err();
    let ConnectError::AllFailed { failures } = &err else {
        panic!("expected aggregate failure, got {err}");
    };
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().any(|f| f.address == refused));
    assert!(failures.iter().any(|f| f.address == unreachable));
    assert!(
        failures
            .iter()
            .all(|f| matches!(f.reason, FailureReason::Transport(_)))
    );
    assert!(err.is_retryable());
    assert_eq!(a.dial_stats().failed, 1);
}

#[tokio::test]
async fn test_no_addresses_and_self_dial() {
    let net = Net::new();
    let a = net.open().await;
    let unknown = Keypair::generate().peer_id();

    let err = a.connect(unknown, deadline()).await.unwrap_err();
    assert_eq!(err, ConnectError::NoAddresses(unknown));

    let err = a.connect(a.local_peer(), deadline()).await.unwrap_err();
    assert_eq!(err, ConnectError::SelfDial);
    assert_eq!(net.net.dial_count(port(&a)), 0);
}

#[tokio::test]
async fn test_cancel_stops_every_attempt() {
    let net = Net::new();
    let a = net.open().await;
    let b = net.open().await;
    net.publish(&b);
    net.net.inject_fault(port(&b), Fault::Blackhole);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let started = Instant::now();
    let err = a
        .connect_with_cancel(b.local_peer(), Instant::now() + Duration::from_secs(30), cancel)
        .await
        .unwrap_err();
    assert_eq!(err, ConnectError::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(2));

    wait_for(|| net.net.pending_dials() == 0 && a.dialer().in_flight() == 0).await;
    assert!(a.connections(&b.local_peer()).is_empty());
}

#[tokio::test]
async fn test_deadline_elapses() {
    let net = Net::new();
    let a = net.open().await;
    let b = net.open().await;
    net.publish(&b);
    net.net.inject_fault(port(&b), Fault::Blackhole);

    let err = a
        .connect(b.local_peer(), Instant::now() + Duration::from_millis(300))
        .await
        .unwrap_err();
    assert_eq!(err, ConnectError::Timeout);
    wait_for(|| net.net.pending_dials() == 0 && a.dialer().in_flight() == 0).await;
}

#[tokio::test]
async fn test_relayed_connection_upgrades_in_place() {
    let net = Net::new();
    let relay = net.relay().await;
    let a = net
        .node(
            Keypair::generate(),
            NatBehavior::EndpointIndependent,
            StaticNat::default(),
            NodeConfig::default(),
        )
        .await;
    let b = net
        .node(
            Keypair::generate(),
            NatBehavior::EndpointIndependent,
            StaticNat::default(),
            NodeConfig::default(),
        )
        .await;
    reserve_on(&b, &relay).await;
    net.publish(&b);

    // B's NAT filters the direct dial, so the first connection is relayed
    let conn = a.connect(b.local_peer(), deadline()).await.unwrap();
    let conn_id = conn.id();
    assert_eq!(a.dial_stats().relayed, 1);

    wait_for(|| conn.path_kind() == PathKind::Direct).await;
    assert_eq!(conn.id(), conn_id);
    assert_eq!(a.punch_state(&b.local_peer()), PunchState::Succeeded);
    assert_eq!(a.primary(&b.local_peer()).unwrap().id(), conn_id);

    let at_a = a.connections(&b.local_peer());
    assert_eq!(at_a.len(), 2);
    let backup = at_a
        .iter()
        .find(|c| c.role() == ConnectionRole::Backup)
        .unwrap();
    assert_eq!(backup.path_kind(), PathKind::Relayed);
    assert_eq!(backup.relay_peer(), Some(relay.local_peer()));

    let b_primary = b.primary(&a.local_peer()).unwrap();
    wait_for(|| b_primary.path_kind() == PathKind::Direct).await;
}

#[tokio::test]
async fn test_idle_backup_is_reaped() {
    let net = Net::new();
    let relay = net.relay().await;
    let lifecycle = LifecycleConfig::default()
        .with_backup_idle_timeout(Duration::from_millis(300))
        .with_reap_interval(Duration::from_millis(50));
    let a = net
        .node(
            Keypair::generate(),
            NatBehavior::EndpointIndependent,
            StaticNat::default(),
            NodeConfig::default().with_lifecycle(lifecycle),
        )
        .await;
    let b = net
        .node(
            Keypair::generate(),
            NatBehavior::EndpointIndependent,
            StaticNat::default(),
            NodeConfig::default(),
        )
        .await;
    reserve_on(&b, &relay).await;
    net.publish(&b);

    let conn = a.connect(b.local_peer(), deadline()).await.unwrap();
    wait_for(|| conn.path_kind() == PathKind::Direct).await;
    wait_for(|| a.connections(&b.local_peer()).len() == 1).await;

    assert!(conn.is_healthy());
    assert_eq!(a.primary(&b.local_peer()).unwrap().id(), conn.id());
}

#[tokio::test]
async fn test_symmetric_pair_stays_relayed() {
    let net = Net::new();
    let relay = net.relay().await;
    let b_key = Keypair::generate();
    let b_id = b_key.peer_id();

    let a_nat = StaticNat::new(NatType::AddressDependent);
    a_nat.set_remote(b_id, NatType::AddressDependent);
    let a = net
        .node(
            Keypair::generate(),
            NatBehavior::Symmetric,
            a_nat,
            NodeConfig::default(),
        )
        .await;
    let b = net
        .node(
            b_key,
            NatBehavior::Symmetric,
            StaticNat::new(NatType::AddressDependent),
            NodeConfig::default(),
        )
        .await;
    reserve_on(&b, &relay).await;
    net.publish(&b);

    let started = Instant::now();
    let conn = a.connect(b_id, deadline()).await.unwrap();
    assert_eq!(conn.path_kind(), PathKind::Relayed);
    assert!(started.elapsed() < Duration::from_secs(2));

    wait_for(|| a.punch_state(&b_id) == PunchState::Failed).await;
    let stats = a.punch_stats();
    assert_eq!(stats.rounds, 0);
    assert_eq!(stats.infeasible, 1);
    assert_eq!(conn.path_kind(), PathKind::Relayed);
    assert!(conn.is_healthy());
    assert_eq!(a.connections(&b_id).len(), 1);
}

#[tokio::test]
async fn test_streams_multiplex_over_circuit() {
    let net = Net::new();
    let relay = net.relay().await;
    let config = NodeConfig::default().with_holepunch(HolePunchConfig::disabled());
    let a = net
        .node(
            Keypair::generate(),
            NatBehavior::Symmetric,
            StaticNat::default(),
            config.clone(),
        )
        .await;
    let b = net
        .node(
            Keypair::generate(),
            NatBehavior::Symmetric,
            StaticNat::default(),
            config,
        )
        .await;
    reserve_on(&b, &relay).await;
    net.publish(&b);

    let conn = a.connect(b.local_peer(), deadline()).await.unwrap();
    assert_eq!(conn.path_kind(), PathKind::Relayed);

    let mut chat = a.open_stream(&conn, "/chat/1").await.unwrap();
    let mut file = a.open_stream(&conn, "/file/1").await.unwrap();
    file.write_all(b"file bytes").await.unwrap();
    chat.write_all(b"chat hello").await.unwrap();

    for _ in 0..2 {
        let (at_b, mut inbound) = b.accept_stream().await.unwrap();
        assert_eq!(at_b.remote_peer(), a.local_peer());
        assert_eq!(at_b.path_kind(), PathKind::Relayed);
        let mut buf = [0u8; 10];
        inbound.read_exact(&mut buf).await.unwrap();
        match inbound.protocol() {
            "/chat/1" => assert_eq!(&buf, b"chat hello"),
            "/file/1" => assert_eq!(&buf, b"file bytes"),
            other => panic!("unexpected protocol {other}"),
        }
    }

    assert_eq!(a.punch_state(&b.local_peer()), PunchState::Idle);
    assert_eq!(relay.relay_server().unwrap().stats().circuits_opened, 1);
}

#[tokio::test]
async fn test_relay_cache_supplies_addresses() {
    let net = Net::new();
    let relay = net.relay().await;
    let a = net.open().await;
    let b = net.open().await;
    reserve_on(&a, &relay).await;
    reserve_on(&b, &relay).await;

    // Nothing in the directory; R knows B's addresses from its reservation
    let conn = a.connect(b.local_peer(), deadline()).await.unwrap();
    assert_eq!(conn.path_kind(), PathKind::Direct);
    assert_eq!(conn.remote_peer(), b.local_peer());
    assert!(
        a.dialer()
            .address_book()
            .addresses(&b.local_peer())
            .contains(&listen_addr(&b))
    );
}

#[tokio::test]
async fn test_accept_stream_delivers_application_streams() {
    let net = Net::new();
    let a = net.open().await;
    let b = net.open().await;
    net.publish(&b);

    let conn = a.connect(b.local_peer(), deadline()).await.unwrap();
    let mut out = a.open_stream(&conn, "/chat/1").await.unwrap();
    out.write_all(b"hello").await.unwrap();

    let (at_b, mut inbound) = b.accept_stream().await.unwrap();
    assert_eq!(at_b.remote_peer(), a.local_peer());
    assert_eq!(inbound.protocol(), "/chat/1");
    let mut buf = [0u8; 5];
    inbound.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
}

#[tokio::test]
async fn test_shutdown_stops_everything() {
    let net = Net::new();
    let a = net.open().await;
    let b = net.open().await;
    net.publish(&b);
    a.connect(b.local_peer(), deadline()).await.unwrap();

    a.shutdown().await;
    assert!(a.is_shutdown());
    assert!(a.all_connections().is_empty());
    assert_eq!(
        a.connect(b.local_peer(), deadline()).await.unwrap_err(),
        ConnectError::Shutdown
    );
    assert!(a.accept_stream().await.is_none());
    assert!(matches!(
        a.listen(&DialAddress::memory(0)).await,
        Err(NodeError::Shutdown)
    ));

    // Shutting down twice is harmless
    a.shutdown().await;
}

#[tokio::test]
async fn test_start_twice() {
    let net = Net::new();
    let a = net.open().await;
    assert!(matches!(a.start().await, Err(NodeError::AlreadyStarted)));
}

#[tokio::test]
async fn test_builder_rejects_foreign_transport() {
    let net = MemoryNetwork::new();
    let other: PeerId = Keypair::generate().peer_id();
    let result = Node::builder(
        Keypair::generate(),
        Arc::new(net.transport(other, NatBehavior::Open)),
    )
    .build();
    assert!(matches!(result, Err(NodeError::Config(_))));
}
