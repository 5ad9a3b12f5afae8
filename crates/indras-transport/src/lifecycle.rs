//! Connection lifecycle manager
//!
//! Owns the [`ConnectionPool`] and one watcher task per connection. The
//! watcher accepts inbound streams on the connection's current session and
//! notices when that session dies. Retention policy:
//!
//! - an upgrade from relayed to direct swaps the direct session into the
//!   caller's handle and keeps the relayed session alive as a `Backup`
//!   connection with its own (shorter) idle timeout
//! - when an upgraded direct path fails and a backup exists, the backup's
//!   session is swapped back in and a `Downgraded` event is emitted
//!
//! Events go out over a broadcast channel. Sending never waits on
//! subscribers, so teardown is never held up by a slow listener.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use indras_core::{ConnectionEvent, ConnectionRole, DisconnectReason, PathKind, PeerId};

use crate::connection::{Connection, ConnectionPath};
use crate::error::ConnectionError;
use crate::mux::Stream;
use crate::pool::ConnectionPool;

/// Lifecycle policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Maximum live connections, backups included
    pub max_connections: usize,
    /// Idle timeout for primary connections in milliseconds
    pub idle_timeout_ms: u64,
    /// Idle timeout for relayed backups retained after an upgrade
    pub backup_idle_timeout_ms: u64,
    /// How often idle connections are swept
    pub reap_interval_ms: u64,
    /// Buffered events per subscriber before it starts lagging
    pub event_capacity: usize,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            idle_timeout_ms: 60_000,
            backup_idle_timeout_ms: 30_000,
            reap_interval_ms: 1_000,
            event_capacity: 256,
        }
    }
}

impl LifecycleConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn backup_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.backup_idle_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_backup_idle_timeout(mut self, timeout: Duration) -> Self {
        self.backup_idle_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval_ms = interval.as_millis() as u64;
        self
    }
}

/// Receives inbound streams accepted on pooled connections
pub trait StreamHandler: Send + Sync + 'static {
    fn handle_stream(&self, conn: Connection, stream: Stream);
}

struct Inner {
    config: LifecycleConfig,
    pool: ConnectionPool,
    events: broadcast::Sender<ConnectionEvent>,
    handler: RwLock<Option<Arc<dyn StreamHandler>>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Tracks connections, applies retention policy, and emits events
#[derive(Clone)]
pub struct LifecycleManager {
    inner: Arc<Inner>,
}

impl LifecycleManager {
    /// Create a manager and start its idle reaper. Requires a tokio runtime.
    pub fn new(config: LifecycleConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let inner = Arc::new(Inner {
            pool: ConnectionPool::new(config.max_connections),
            events,
            handler: RwLock::new(None),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            config,
        });

        inner.tasks.spawn(reap_loop(
            Arc::downgrade(&inner),
            inner.config.reap_interval(),
            inner.shutdown.clone(),
        ));

        Self { inner }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.inner.pool
    }

    /// Route inbound streams on every managed connection to `handler`
    pub fn set_stream_handler(&self, handler: Arc<dyn StreamHandler>) {
        *self.inner.handler.write() = Some(handler);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Every connection to a peer, primaries first
    pub fn connections(&self, peer: &PeerId) -> Vec<Connection> {
        self.inner.pool.get(peer)
    }

    pub fn all_connections(&self) -> Vec<Connection> {
        self.inner.pool.all()
    }

    /// The healthy primary connection for a peer, if any
    pub fn primary(&self, peer: &PeerId) -> Option<Connection> {
        self.inner.pool.primary(peer)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    fn emit(&self, event: ConnectionEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    /// Add a verified connection to the pool and start watching it
    pub fn register(&self, conn: Connection) -> Result<Connection, ConnectionError> {
        if self.is_shutdown() {
            conn.session().close();
            return Err(ConnectionError::Shutdown);
        }
        if let Err(e) = self.inner.pool.insert(conn.clone()) {
            conn.session().close();
            return Err(e);
        }

        info!(
            peer = %conn.remote_peer().short_id(),
            conn_id = conn.id(),
            path = %conn.path_kind(),
            addr = %conn.remote_addr(),
            "Connection registered"
        );
        self.emit(ConnectionEvent::connected(
            conn.remote_peer(),
            conn.id(),
            conn.path_kind(),
        ));
        self.spawn_watcher(conn.clone());
        Ok(conn)
    }

    fn spawn_watcher(&self, conn: Connection) {
        let manager = self.clone();
        self.inner.tasks.spawn(async move { manager.watch(conn).await });
    }

    async fn watch(self, conn: Connection) {
        let mut path_rx = conn.watch_path();
        loop {
            let _ = path_rx.borrow_and_update();
            let session = conn.session();

            tokio::select! {
                stream = session.accept() => {
                    if let Some(stream) = stream {
                        self.dispatch(&conn, stream);
                        continue;
                    }
                }
                changed = path_rx.changed() => {
                    if changed.is_ok() {
                        continue;
                    }
                }
                _ = conn.closed() => return,
                _ = self.inner.shutdown.cancelled() => return,
            }

            // Session ended. A swap may have raced the close.
            if !conn.session().ptr_eq(&session) {
                continue;
            }
            if conn.is_closed() {
                return;
            }
            if conn.role() == ConnectionRole::Primary
                && conn.path_kind() == PathKind::Direct
                && self.fallback(&conn)
            {
                continue;
            }

            let reason = if conn.is_degraded() {
                DisconnectReason::ReservationLost
            } else if session.remote_went_away() {
                DisconnectReason::Closed
            } else {
                DisconnectReason::TransportError("transport closed".into())
            };
            self.close_with(&conn, reason);
            return;
        }
    }

    fn dispatch(&self, conn: &Connection, stream: Stream) {
        let handler = self.inner.handler.read().clone();
        match handler {
            Some(handler) => handler.handle_stream(conn.clone(), stream),
            None => debug!(
                peer = %conn.remote_peer().short_id(),
                protocol = stream.protocol(),
                "No stream handler, dropping inbound stream"
            ),
        }
    }

    /// Flag a relayed connection as having a direct upgrade in flight
    pub fn set_upgrading(&self, conn: &Connection, upgrading: bool) {
        conn.set_upgrading(upgrading);
    }

    /// Move `primary` onto a direct path, retaining its relayed path as a backup
    ///
    /// The caller's handle keeps its id and only its path kind changes.
    #[instrument(skip(self, primary, direct), fields(peer = %primary.remote_peer().short_id(), conn_id = primary.id()))]
    pub fn upgrade(
        &self,
        primary: &Connection,
        direct: ConnectionPath,
    ) -> Result<(), ConnectionError> {
        primary.set_upgrading(false);
        if primary.path_kind() == PathKind::Direct {
            debug!("Already direct, discarding extra path");
            direct.session.close();
            return Ok(());
        }
        if !self.inner.pool.contains(primary) || primary.is_closed() {
            direct.session.close();
            return Err(ConnectionError::NotFound(primary.id()));
        }

        let peer = primary.remote_peer();
        let relayed = primary.swap_path(direct);
        let backup = Connection::new(peer, relayed);
        backup.set_role(ConnectionRole::Backup);

        let backup_id = match self.inner.pool.insert(backup.clone()) {
            Ok(()) => {
                self.spawn_watcher(backup.clone());
                Some(backup.id())
            }
            Err(e) => {
                debug!(error = %e, "No room to retain relayed backup");
                backup.session().close();
                None
            }
        };

        info!(backup = ?backup_id, "Connection upgraded to direct");
        self.emit(ConnectionEvent::upgraded(peer, primary.id(), backup_id));
        Ok(())
    }

    /// Adopt a freshly established direct path for a peer
    ///
    /// Upgrades the existing relayed primary in place, or registers a new
    /// connection if there is none.
    pub fn adopt_direct(
        &self,
        peer: PeerId,
        direct: ConnectionPath,
    ) -> Result<Connection, ConnectionError> {
        match self.inner.pool.primary(&peer) {
            Some(primary) => {
                self.upgrade(&primary, direct)?;
                Ok(primary)
            }
            None => self.register(Connection::new(peer, direct)),
        }
    }

    fn fallback(&self, primary: &Connection) -> bool {
        let peer = primary.remote_peer();
        let Some(backup) = self.inner.pool.backup(&peer) else {
            return false;
        };
        if !backup.begin_close() {
            return false;
        }
        self.inner.pool.remove(&peer, backup.id());
        let relayed = backup.path();
        backup.finish_close();

        let dead = primary.swap_path(relayed);
        dead.session.close();

        warn!(
            peer = %peer.short_id(),
            conn_id = primary.id(),
            "Direct path lost, fell back to relayed backup"
        );
        self.emit(ConnectionEvent::downgraded(peer, primary.id()));
        true
    }

    /// Mark every circuit through `relay` as degraded
    ///
    /// Returns how many connections were affected.
    pub fn mark_degraded(&self, relay: &PeerId) -> usize {
        let mut count = 0;
        for conn in self.inner.pool.all() {
            if conn.relay_peer() == Some(*relay) && !conn.is_degraded() {
                conn.set_degraded(true);
                warn!(
                    peer = %conn.remote_peer().short_id(),
                    relay = %relay.short_id(),
                    conn_id = conn.id(),
                    "Relayed connection degraded"
                );
                self.emit(ConnectionEvent::degraded(conn.remote_peer(), conn.id(), *relay));
                count += 1;
            }
        }
        count
    }

    /// Close a connection
    ///
    /// Closing a primary also closes any relayed backup kept for the same peer.
    pub fn close(&self, conn: &Connection) {
        self.close_with(conn, DisconnectReason::Closed);
        if conn.role() == ConnectionRole::Primary {
            for other in self.inner.pool.get(&conn.remote_peer()) {
                if other.role() == ConnectionRole::Backup {
                    self.close_with(&other, DisconnectReason::Closed);
                }
            }
        }
    }

    fn close_with(&self, conn: &Connection, reason: DisconnectReason) -> bool {
        if !conn.begin_close() {
            return false;
        }
        self.inner.pool.remove(&conn.remote_peer(), conn.id());
        conn.session().close();
        conn.finish_close();

        debug!(
            peer = %conn.remote_peer().short_id(),
            conn_id = conn.id(),
            reason = %reason,
            "Connection closed"
        );
        self.emit(ConnectionEvent::disconnected(
            conn.remote_peer(),
            conn.id(),
            reason,
        ));
        true
    }

    /// Close connections idle past their role's timeout. Returns how many.
    pub fn reap_idle(&self) -> usize {
        let mut reaped = 0;
        for conn in self.inner.pool.all() {
            if conn.is_keep_alive() || conn.stats().open_streams > 0 {
                continue;
            }
            let timeout = match conn.role() {
                ConnectionRole::Primary => self.inner.config.idle_timeout(),
                ConnectionRole::Backup => self.inner.config.backup_idle_timeout(),
            };
            if conn.idle_for() >= timeout && self.close_with(&conn, DisconnectReason::IdleTimeout) {
                reaped += 1;
            }
        }
        reaped
    }

    /// Close every connection and wait for watcher tasks to finish
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!(connections = self.inner.pool.len(), "Shutting down lifecycle manager");
        self.inner.shutdown.cancel();
        for conn in self.inner.pool.all() {
            self.close_with(&conn, DisconnectReason::Shutdown);
        }
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }
}

async fn reap_loop(inner: Weak<Inner>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else { break };
                let reaped = LifecycleManager { inner }.reap_idle();
                if reaped > 0 {
                    debug!(reaped, "Reaped idle connections");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use indras_core::{DialAddress, ProtocolCategory};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    use super::*;
    use crate::connection::tests::{peer, session_pair};
    use crate::mux::MuxSession;

    fn relayed_path(session: MuxSession) -> ConnectionPath {
        ConnectionPath::relayed(
            session,
            DialAddress::memory(1),
            DialAddress::memory(2),
            peer(9),
            ProtocolCategory::Application,
        )
    }

    fn direct_path(session: MuxSession) -> ConnectionPath {
        ConnectionPath::direct(session, DialAddress::memory(3), DialAddress::memory(4))
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        tokio::time::timeout(Duration::from_secs(3), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    struct Collect(mpsc::UnboundedSender<(Connection, Stream)>);

    impl StreamHandler for Collect {
        fn handle_stream(&self, conn: Connection, stream: Stream) {
            let _ = self.0.send((conn, stream));
        }
    }

    #[tokio::test]
    async fn test_register_and_close_emit_events() {
        let manager = LifecycleManager::new(LifecycleConfig::default());
        let mut events = manager.subscribe();
        let (local, _remote) = session_pair();

        let conn = manager
            .register(Connection::new(peer(2), direct_path(local)))
            .unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectionEvent::Connected { path: PathKind::Direct, .. }
        ));

        manager.close(&conn);
        match events.recv().await.unwrap() {
            ConnectionEvent::Disconnected { conn_id, reason, .. } => {
                assert_eq!(conn_id, conn.id());
                assert_eq!(reason, DisconnectReason::Closed);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(manager.connections(&peer(2)).is_empty());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_upgrade_retains_backup_and_keeps_handle() {
        let manager = LifecycleManager::new(LifecycleConfig::default());
        let mut events = manager.subscribe();
        let (relay_local, _relay_remote) = session_pair();
        let (direct_local, _direct_remote) = session_pair();

        let conn = manager
            .register(Connection::new(peer(2), relayed_path(relay_local)))
            .unwrap();
        let _ = events.recv().await;
        manager.set_upgrading(&conn, true);
        assert!(conn.is_upgrading());

        manager.upgrade(&conn, direct_path(direct_local)).unwrap();

        assert_eq!(conn.path_kind(), PathKind::Direct);
        assert!(!conn.is_upgrading());
        let listed = manager.connections(&peer(2));
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0], conn);
        assert_eq!(listed[1].role(), ConnectionRole::Backup);
        assert_eq!(listed[1].path_kind(), PathKind::Relayed);

        match events.recv().await.unwrap() {
            ConnectionEvent::Upgraded { conn_id, backup, .. } => {
                assert_eq!(conn_id, conn.id());
                assert_eq!(backup, Some(listed[1].id()));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(manager.primary(&peer(2)), Some(conn));
    }

    #[tokio::test]
    async fn test_backup_idles_out_before_primary() {
        let config = LifecycleConfig::default()
            .with_idle_timeout(Duration::from_secs(60))
            .with_backup_idle_timeout(Duration::from_millis(100))
            .with_reap_interval(Duration::from_millis(20));
        let manager = LifecycleManager::new(config);
        let (relay_local, _relay_remote) = session_pair();
        let (direct_local, _direct_remote) = session_pair();

        let conn = manager
            .register(Connection::new(peer(2), relayed_path(relay_local)))
            .unwrap();
        manager.upgrade(&conn, direct_path(direct_local)).unwrap();
        assert_eq!(manager.connections(&peer(2)).len(), 2);

        wait_for(|| manager.connections(&peer(2)).len() == 1).await;
        assert_eq!(manager.connections(&peer(2)), vec![conn.clone()]);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_backup_of_quiet_relay_gets_full_idle_window() {
        let config = LifecycleConfig::default()
            .with_idle_timeout(Duration::from_millis(600))
            .with_backup_idle_timeout(Duration::from_millis(300))
            .with_reap_interval(Duration::from_millis(10));
        let manager = LifecycleManager::new(config);
        let (relay_local, _relay_remote) = session_pair();
        let (direct_local, _direct_remote) = session_pair();

        let conn = manager
            .register(Connection::new(peer(2), relayed_path(relay_local)))
            .unwrap();
        // Quiet for longer than a backup may idle, shorter than a primary
        tokio::time::sleep(Duration::from_millis(400)).await;
        manager.upgrade(&conn, direct_path(direct_local)).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let listed = manager.connections(&peer(2));
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].role(), ConnectionRole::Backup);

        wait_for(|| manager.connections(&peer(2)).len() == 1).await;
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_direct_failure_falls_back_to_backup() {
        let manager = LifecycleManager::new(LifecycleConfig::default());
        let (relay_local, relay_remote) = session_pair();
        let (direct_local, direct_remote) = session_pair();

        let conn = manager
            .register(Connection::new(peer(2), relayed_path(relay_local)))
            .unwrap();
        manager.upgrade(&conn, direct_path(direct_local)).unwrap();
        let mut events = manager.subscribe();

        direct_remote.close();

        match events.recv().await.unwrap() {
            ConnectionEvent::Downgraded { conn_id, .. } => assert_eq!(conn_id, conn.id()),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(conn.path_kind(), PathKind::Relayed);
        assert_eq!(manager.connections(&peer(2)), vec![conn.clone()]);

        // The relayed path is live again for the same handle
        let mut out = conn.open_stream("/chat/1").await.unwrap();
        out.write_all(b"back").await.unwrap();
        let mut inbound = relay_remote.accept().await.unwrap();
        let mut buf = [0u8; 4];
        inbound.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"back");
    }

    #[tokio::test]
    async fn test_remote_close_disconnects() {
        let manager = LifecycleManager::new(LifecycleConfig::default());
        let mut events = manager.subscribe();
        let (local, remote) = session_pair();
        let conn = manager
            .register(Connection::new(peer(3), direct_path(local)))
            .unwrap();
        let _ = events.recv().await;

        remote.close();
        match events.recv().await.unwrap() {
            ConnectionEvent::Disconnected { reason, .. } => {
                assert_eq!(reason, DisconnectReason::Closed)
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_degraded_relay_is_not_reused() {
        let manager = LifecycleManager::new(LifecycleConfig::default());
        let (local, _remote) = session_pair();
        let conn = manager
            .register(Connection::new(peer(2), relayed_path(local)))
            .unwrap();
        let mut events = manager.subscribe();

        assert_eq!(manager.mark_degraded(&peer(9)), 1);
        assert_eq!(manager.mark_degraded(&peer(9)), 0);
        assert!(conn.is_degraded());
        assert!(manager.primary(&peer(2)).is_none());
        assert!(matches!(
            events.recv().await.unwrap(),
            ConnectionEvent::Degraded { .. }
        ));
    }

    #[tokio::test]
    async fn test_slow_subscriber_never_blocks_teardown() {
        let manager = LifecycleManager::new(LifecycleConfig {
            event_capacity: 2,
            ..LifecycleConfig::default()
        });
        let _never_read = manager.subscribe();

        for _ in 0..20 {
            let (local, _remote) = session_pair();
            let conn = manager
                .register(Connection::new(peer(4), direct_path(local)))
                .unwrap();
            manager.close(&conn);
        }
        assert!(manager.all_connections().is_empty());
    }

    #[tokio::test]
    async fn test_inbound_streams_reach_handler() {
        let manager = LifecycleManager::new(LifecycleConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.set_stream_handler(Arc::new(Collect(tx)));

        let (local, remote) = session_pair();
        let conn = manager
            .register(Connection::new(peer(5), direct_path(local)))
            .unwrap();

        let _out = remote.open_stream("/chat/1").await.unwrap();
        let (owner, stream) = rx.recv().await.unwrap();
        assert_eq!(owner, conn);
        assert_eq!(stream.protocol(), "/chat/1");
    }

    #[tokio::test]
    async fn test_keep_alive_is_not_reaped() {
        let manager = LifecycleManager::new(
            LifecycleConfig::default().with_idle_timeout(Duration::from_millis(10)),
        );
        let (a, _ra) = session_pair();
        let (b, _rb) = session_pair();
        let pinned = manager
            .register(Connection::new(peer(6), direct_path(a)))
            .unwrap();
        pinned.set_keep_alive(true);
        let idle = manager
            .register(Connection::new(peer(7), direct_path(b)))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        manager.reap_idle();
        assert!(!pinned.is_closed());
        assert!(idle.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let manager = LifecycleManager::new(LifecycleConfig::default());
        let (local, _remote) = session_pair();
        let conn = manager
            .register(Connection::new(peer(8), direct_path(local)))
            .unwrap();

        manager.shutdown().await;
        assert!(conn.is_closed());
        assert!(manager.all_connections().is_empty());

        let (late, _r) = session_pair();
        assert_eq!(
            manager.register(Connection::new(peer(8), direct_path(late))),
            Err(ConnectionError::Shutdown)
        );
    }
}
