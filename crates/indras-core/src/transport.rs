//! External collaborator traits
//!
//! The connectivity core consumes these and never implements the real
//! thing itself:
//!
//! - [`Transport`]: dial and listen primitives that hand back a raw duplex
//!   byte stream already bound to a verified identity
//! - [`AddressDirectory`]: best-effort candidate addresses for an identity
//! - [`NatDetector`]: NAT classification for the local and remote peers
//! - [`SecureUpgrade`]: identity proof over an arbitrary byte stream, used
//!   for relay circuits where the relay itself is not trusted
//!
//! [`crate::memory`] provides in-process implementations for tests.

use std::fmt;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::address::DialAddress;
use crate::error::TransportError;
use crate::identity::PeerId;
use crate::nat::NatType;

/// Any duplex byte stream usable as a connection's transport
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased duplex byte stream
pub type BoxedIo = Box<dyn AsyncIo>;

/// A raw authenticated byte stream produced by a [`Transport`]
pub struct RawConnection {
    pub io: BoxedIo,
    /// Identity verified by the transport's security handshake
    pub remote_peer: PeerId,
    pub local_addr: DialAddress,
    pub remote_addr: DialAddress,
}

impl fmt::Debug for RawConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawConnection")
            .field("remote_peer", &self.remote_peer)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

/// Stream of inbound raw connections for one listen address
#[derive(Debug)]
pub struct Listener {
    local_addr: DialAddress,
    incoming: mpsc::Receiver<RawConnection>,
}

impl Listener {
    pub fn new(local_addr: DialAddress, incoming: mpsc::Receiver<RawConnection>) -> Self {
        Self {
            local_addr,
            incoming,
        }
    }

    pub fn local_addr(&self) -> &DialAddress {
        &self.local_addr
    }

    /// Wait for the next inbound connection
    ///
    /// Returns `None` once the listener has been closed.
    pub async fn accept(&mut self) -> Option<RawConnection> {
        self.incoming.recv().await
    }
}

/// Raw transport plus transport-level security
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Identity this transport authenticates as
    fn local_peer(&self) -> PeerId;

    /// Whether this transport can dial the given address
    fn supports(&self, addr: &DialAddress) -> bool;

    /// Dial an address, completing the security handshake before `deadline`
    ///
    /// The returned connection's `remote_peer` is authoritative. Callers
    /// compare it against the identity they meant to reach.
    async fn dial(
        &self,
        addr: &DialAddress,
        deadline: Instant,
    ) -> Result<RawConnection, TransportError>;

    /// Start listening on an address
    async fn listen(&self, addr: &DialAddress) -> Result<Listener, TransportError>;
}

/// Source of candidate addresses for an identity
#[async_trait]
pub trait AddressDirectory: Send + Sync + 'static {
    /// Best-effort lookup. An empty result is not an error.
    async fn lookup(&self, peer: &PeerId) -> Vec<DialAddress>;
}

/// NAT classification for the local node and its peers
#[async_trait]
pub trait NatDetector: Send + Sync + 'static {
    fn local_nat(&self) -> NatType;

    async fn remote_nat(&self, peer: &PeerId) -> NatType;
}

/// Authenticates the two ends of an arbitrary byte stream
#[async_trait]
pub trait SecureUpgrade: Send + Sync + 'static {
    /// Prove our identity and verify that the remote is `expected`
    async fn upgrade_outbound(
        &self,
        io: BoxedIo,
        expected: PeerId,
    ) -> Result<(BoxedIo, PeerId), TransportError>;

    /// Prove our identity and learn who dialed us
    async fn upgrade_inbound(&self, io: BoxedIo) -> Result<(BoxedIo, PeerId), TransportError>;
}
