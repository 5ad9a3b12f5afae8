//! Connection handles
//!
//! A [`Connection`] is one authenticated, multiplexed session to a verified
//! remote identity. The handle stays stable while the lifecycle manager
//! swaps the path underneath it (relayed to direct on upgrade, back to
//! relayed on fallback), so callers never need to re-dial.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use indras_core::{ConnectionId, ConnectionRole, DialAddress, PathKind, PeerId, ProtocolCategory};

use crate::error::StreamError;
use crate::mux::{MuxSession, Stream};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a connection
///
/// `Dialing` is only reported for peers with an attempt in flight and no
/// connection yet; a [`Connection`] itself starts out `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Dialing,
    /// Established, no stream opened yet
    Connected,
    /// No open streams
    Idle,
    /// At least one open stream
    Active,
    Closing,
    Closed,
}

const STATE_OPEN: u8 = 0;
const STATE_CLOSING: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// The transport path a connection currently runs over
#[derive(Debug, Clone)]
pub struct ConnectionPath {
    pub kind: PathKind,
    pub local_addr: DialAddress,
    pub remote_addr: DialAddress,
    pub session: MuxSession,
    /// Relay forwarding this path, for relayed circuits
    pub relay: Option<PeerId>,
    /// Traffic category a relayed circuit was opened for
    pub category: Option<ProtocolCategory>,
}

impl ConnectionPath {
    pub fn direct(session: MuxSession, local_addr: DialAddress, remote_addr: DialAddress) -> Self {
        Self {
            kind: PathKind::Direct,
            local_addr,
            remote_addr,
            session,
            relay: None,
            category: None,
        }
    }

    pub fn relayed(
        session: MuxSession,
        local_addr: DialAddress,
        remote_addr: DialAddress,
        relay: PeerId,
        category: ProtocolCategory,
    ) -> Self {
        Self {
            kind: PathKind::Relayed,
            local_addr,
            remote_addr,
            session,
            relay: Some(relay),
            category: Some(category),
        }
    }
}

/// Point-in-time counters for a connection's current path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    pub path: PathKind,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub open_streams: usize,
    pub streams_opened: u64,
    pub created_at: DateTime<Utc>,
}

struct ConnInner {
    id: ConnectionId,
    remote: PeerId,
    path: RwLock<ConnectionPath>,
    path_version: watch::Sender<u64>,
    role: AtomicU8,
    /// When the connection last changed role
    role_since: Mutex<Instant>,
    state: AtomicU8,
    upgrading: AtomicBool,
    degraded: AtomicBool,
    keep_alive: AtomicBool,
    created_at: DateTime<Utc>,
    closed: CancellationToken,
}

/// Handle to an authenticated session with a remote peer
///
/// Clones share state. Equality is by connection id.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl Connection {
    /// Wrap a path to a peer whose identity has already been verified
    pub fn new(remote: PeerId, path: ConnectionPath) -> Self {
        let (path_version, _) = watch::channel(0);
        Self {
            inner: Arc::new(ConnInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                remote,
                path: RwLock::new(path),
                path_version,
                role: AtomicU8::new(role_to_u8(ConnectionRole::Primary)),
                role_since: Mutex::new(Instant::now()),
                state: AtomicU8::new(STATE_OPEN),
                upgrading: AtomicBool::new(false),
                degraded: AtomicBool::new(false),
                keep_alive: AtomicBool::new(false),
                created_at: Utc::now(),
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    /// The verified remote identity
    pub fn remote_peer(&self) -> PeerId {
        self.inner.remote
    }

    pub fn path_kind(&self) -> PathKind {
        self.inner.path.read().kind
    }

    pub fn local_addr(&self) -> DialAddress {
        self.inner.path.read().local_addr.clone()
    }

    pub fn remote_addr(&self) -> DialAddress {
        self.inner.path.read().remote_addr.clone()
    }

    /// Relay forwarding the current path, if relayed
    pub fn relay_peer(&self) -> Option<PeerId> {
        self.inner.path.read().relay
    }

    pub fn role(&self) -> ConnectionRole {
        role_from_u8(self.inner.role.load(Ordering::SeqCst))
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// Whether a direct upgrade is in flight for this relayed connection
    pub fn is_upgrading(&self) -> bool {
        self.inner.upgrading.load(Ordering::SeqCst)
    }

    /// Whether the relay carrying this connection lost its reservation
    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::SeqCst)
    }

    /// Exempt from idle reaping, e.g. a connection holding a relay reservation
    pub fn is_keep_alive(&self) -> bool {
        self.inner.keep_alive.load(Ordering::SeqCst)
    }

    pub fn set_keep_alive(&self, keep_alive: bool) {
        self.inner.keep_alive.store(keep_alive, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == STATE_CLOSED
    }

    /// Usable for new streams and eligible for reuse
    pub fn is_healthy(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == STATE_OPEN
            && !self.is_degraded()
            && !self.inner.path.read().session.is_closed()
    }

    pub fn state(&self) -> ConnectionState {
        match self.inner.state.load(Ordering::SeqCst) {
            STATE_CLOSED => ConnectionState::Closed,
            STATE_CLOSING => ConnectionState::Closing,
            _ => {
                let stats = self.session().stats();
                if stats.open_streams > 0 {
                    ConnectionState::Active
                } else if stats.streams_opened == 0 {
                    ConnectionState::Connected
                } else {
                    ConnectionState::Idle
                }
            }
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        let path = self.inner.path.read();
        let mux = path.session.stats();
        ConnectionStats {
            path: path.kind,
            bytes_sent: mux.bytes_sent,
            bytes_received: mux.bytes_received,
            open_streams: mux.open_streams,
            streams_opened: mux.streams_opened,
            created_at: self.inner.created_at,
        }
    }

    /// Time since the current path last carried traffic or the connection
    /// changed role, whichever is more recent
    ///
    /// A freshly demoted backup starts its idle clock over.
    pub fn idle_for(&self) -> Duration {
        self.session()
            .idle_for()
            .min(self.inner.role_since.lock().elapsed())
    }

    /// Open a new stream tagged with a protocol hint
    ///
    /// Relayed circuits only carry the traffic category they were opened for.
    pub async fn open_stream(&self, protocol: &str) -> Result<Stream, StreamError> {
        if self.inner.state.load(Ordering::SeqCst) != STATE_OPEN {
            return Err(StreamError::ConnectionClosing);
        }
        let session = {
            let path = self.inner.path.read();
            if let Some(carried) = path.category {
                let requested = ProtocolCategory::of(protocol);
                if requested != carried {
                    return Err(StreamError::CategoryMismatch { requested, carried });
                }
            }
            path.session.clone()
        };
        session.open_stream(protocol).await
    }

    /// The session behind the current path
    pub fn session(&self) -> MuxSession {
        self.inner.path.read().session.clone()
    }

    pub fn path(&self) -> ConnectionPath {
        self.inner.path.read().clone()
    }

    /// Resolves once the connection has been closed and removed
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// Receiver notified whenever the path is swapped
    pub fn watch_path(&self) -> watch::Receiver<u64> {
        self.inner.path_version.subscribe()
    }

    pub(crate) fn swap_path(&self, new: ConnectionPath) -> ConnectionPath {
        let old = std::mem::replace(&mut *self.inner.path.write(), new);
        self.inner.path_version.send_modify(|v| *v += 1);
        old
    }

    pub(crate) fn set_role(&self, role: ConnectionRole) {
        self.inner.role.store(role_to_u8(role), Ordering::SeqCst);
        *self.inner.role_since.lock() = Instant::now();
    }

    pub(crate) fn set_upgrading(&self, upgrading: bool) {
        self.inner.upgrading.store(upgrading, Ordering::SeqCst);
    }

    pub(crate) fn set_degraded(&self, degraded: bool) {
        self.inner.degraded.store(degraded, Ordering::SeqCst);
    }

    /// Move to `Closing`. Returns false if already closing or closed.
    pub(crate) fn begin_close(&self) -> bool {
        self.inner
            .state
            .compare_exchange(STATE_OPEN, STATE_CLOSING, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn finish_close(&self) {
        self.inner.state.store(STATE_CLOSED, Ordering::SeqCst);
        self.inner.closed.cancel();
    }
}

fn role_to_u8(role: ConnectionRole) -> u8 {
    match role {
        ConnectionRole::Primary => 0,
        ConnectionRole::Backup => 1,
    }
}

fn role_from_u8(v: u8) -> ConnectionRole {
    if v == 1 {
        ConnectionRole::Backup
    } else {
        ConnectionRole::Primary
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Connection {}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.remote)
            .field("path", &self.path_kind())
            .field("role", &self.role())
            .field("state", &self.state())
            .finish()
    }
}
