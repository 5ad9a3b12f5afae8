//! Integration tests for indras-transport
//!
//! Runs the full session stack over the in-memory network: dial, signed
//! handshake, multiplexing, and lifecycle registration on both sides.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;

use indras_core::handshake::SignedHandshake;
use indras_core::memory::{MemoryNetwork, NatBehavior};
use indras_core::{
    ConnectionEvent, DialAddress, DisconnectReason, Keypair, PathKind, SecureUpgrade, Transport,
};
use indras_transport::{
    Connection, ConnectionPath, LifecycleConfig, LifecycleManager, MuxConfig, MuxSession, Role,
};

struct Peer {
    keypair: Keypair,
    manager: LifecycleManager,
}

impl Peer {
    fn new() -> Self {
        Self {
            keypair: Keypair::generate(),
            manager: LifecycleManager::new(LifecycleConfig::default()),
        }
    }
}

/// Dial `b` from `a` and register the connection on both sides
async fn connect(net: &MemoryNetwork, a: &Peer, b: &Peer) -> (Connection, Connection) {
    let ta = net.transport(a.keypair.peer_id(), NatBehavior::Open);
    let tb = net.transport(b.keypair.peer_id(), NatBehavior::Open);
    let mut listener = tb.listen(&DialAddress::memory(0)).await.unwrap();
    let target = listener.local_addr().clone();

    let deadline = Instant::now() + Duration::from_secs(2);
    let (dialed, accepted) = tokio::join!(ta.dial(&target, deadline), listener.accept());
    let dialed = dialed.unwrap();
    let accepted = accepted.unwrap();

    let ha = SignedHandshake::new(a.keypair.clone());
    let hb = SignedHandshake::new(b.keypair.clone());
    let (out, inbound) = tokio::join!(
        ha.upgrade_outbound(dialed.io, b.keypair.peer_id()),
        hb.upgrade_inbound(accepted.io),
    );
    let (io_a, seen_b) = out.unwrap();
    let (io_b, seen_a) = inbound.unwrap();
    assert_eq!(seen_b, b.keypair.peer_id());
    assert_eq!(seen_a, a.keypair.peer_id());

    let conn_a = a
        .manager
        .register(Connection::new(
            seen_b,
            ConnectionPath::direct(
                MuxSession::new(io_a, Role::Dialer, MuxConfig::default()),
                dialed.local_addr,
                dialed.remote_addr,
            ),
        ))
        .unwrap();
    let conn_b = b
        .manager
        .register(Connection::new(
            seen_a,
            ConnectionPath::direct(
                MuxSession::new(io_b, Role::Listener, MuxConfig::default()),
                accepted.local_addr,
                accepted.remote_addr,
            ),
        ))
        .unwrap();
    (conn_a, conn_b)
}

#[tokio::test]
async fn test_authenticated_session_carries_streams() {
    let net = MemoryNetwork::new();
    let a = Peer::new();
    let b = Peer::new();
    let (conn_a, conn_b) = connect(&net, &a, &b).await;

    assert_eq!(conn_a.path_kind(), PathKind::Direct);
    assert_eq!(conn_b.remote_peer(), a.keypair.peer_id());

    let mut out = conn_a.open_stream("/echo/1").await.unwrap();
    out.write_all(b"hello over memory").await.unwrap();
    out.shutdown().await.unwrap();

    let mut inbound = conn_b.session().accept().await.unwrap();
    assert_eq!(inbound.protocol(), "/echo/1");
    let mut buf = Vec::new();
    inbound.read_to_end(&mut buf).await.unwrap();
    assert_eq!(buf, b"hello over memory");
}

#[tokio::test]
async fn test_close_propagates_to_remote_lifecycle() {
    let net = MemoryNetwork::new();
    let a = Peer::new();
    let b = Peer::new();
    let mut b_events = b.manager.subscribe();
    let (conn_a, conn_b) = connect(&net, &a, &b).await;

    assert!(matches!(
        b_events.recv().await.unwrap(),
        ConnectionEvent::Connected { .. }
    ));

    a.manager.close(&conn_a);

    let event = tokio::time::timeout(Duration::from_secs(2), b_events.recv())
        .await
        .unwrap()
        .unwrap();
    match event {
        ConnectionEvent::Disconnected { conn_id, reason, .. } => {
            assert_eq!(conn_id, conn_b.id());
            assert_eq!(reason, DisconnectReason::Closed);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(b.manager.connections(&a.keypair.peer_id()).is_empty());
}
