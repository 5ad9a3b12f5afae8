//! Self-describing dial addresses
//!
//! Addresses are multiaddrs such as `/ip4/10.0.0.1/udp/4433/quic-v1/p2p/<peer>`.
//! A relay-qualified address is the relay's own address followed by
//! `/p2p-circuit/p2p/<target>`.
//!
//! Peer identities travel in `/p2p` components as identity multihashes
//! wrapping the 32-byte [`PeerId`] digest.

use std::cmp::Ordering;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

pub use multiaddr::{Multiaddr, Protocol};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::AddressError;
use crate::identity::{PEER_ID_LEN, PeerId};

/// Multihash code for digests carried inline
const IDENTITY_CODE: u8 = 0x00;

/// Transport families in preference order
///
/// Stream-multiplexing-native transports sort first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportKind {
    Quic,
    Memory,
    Tcp,
    Other,
}

/// A protocol-tagged network address
///
/// Serializes as its string form for human-readable formats (config files)
/// and as the binary multiaddr on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialAddress(Multiaddr);

impl DialAddress {
    /// Address of an in-process memory listener
    pub fn memory(port: u64) -> Self {
        Self(Multiaddr::empty().with(Protocol::Memory(port)))
    }

    /// Build a relay-qualified address reaching `target` through `relay`
    ///
    /// `relay` should already carry the relay's `/p2p/<id>` suffix.
    pub fn circuit(relay: &DialAddress, target: PeerId) -> Self {
        Self(relay.0.clone().with(Protocol::P2pCircuit)).with_peer(target)
    }

    pub fn as_multiaddr(&self) -> &Multiaddr {
        &self.0
    }

    pub fn iter(&self) -> multiaddr::Iter<'_> {
        self.0.iter()
    }

    /// Append a `/p2p/<peer>` component
    pub fn with_peer(mut self, peer: PeerId) -> Self {
        if self.peer_id() == Some(peer) {
            return self;
        }
        if let Some(component) = p2p_component(&peer) {
            self.0.push(component);
        }
        self
    }

    /// Strip a trailing `/p2p/<peer>` component
    pub fn without_peer(&self) -> DialAddress {
        let mut addr = self.0.clone();
        if matches!(addr.iter().last(), Some(Protocol::P2p(_))) {
            addr.pop();
        }
        Self(addr)
    }

    /// The identity this address claims to reach, if it names one
    pub fn peer_id(&self) -> Option<PeerId> {
        match self.0.iter().last() {
            Some(Protocol::P2p(id)) => peer_from_component(&id),
            _ => None,
        }
    }

    pub fn is_relayed(&self) -> bool {
        self.0.iter().any(|p| matches!(p, Protocol::P2pCircuit))
    }

    /// The relay's own address for a relay-qualified address
    pub fn relay_base(&self) -> Option<DialAddress> {
        if !self.is_relayed() {
            return None;
        }
        Some(Self(self.first_hop().collect()))
    }

    /// The relay's identity for a relay-qualified address
    pub fn relay_peer(&self) -> Option<PeerId> {
        self.relay_base().and_then(|base| base.peer_id())
    }

    fn first_hop(&self) -> impl Iterator<Item = Protocol<'_>> {
        self.0
            .iter()
            .take_while(|p| !matches!(p, Protocol::P2pCircuit))
    }

    /// Transport family of the first hop
    pub fn transport_kind(&self) -> TransportKind {
        let mut kind = TransportKind::Other;
        for component in self.first_hop() {
            let this = match component {
                Protocol::Quic | Protocol::QuicV1 => TransportKind::Quic,
                Protocol::Memory(_) => TransportKind::Memory,
                Protocol::Tcp(_) => TransportKind::Tcp,
                _ => continue,
            };
            kind = kind.min(this);
        }
        kind
    }

    /// Whether the first hop points into a local network
    pub fn is_local(&self) -> bool {
        match self.0.iter().next() {
            Some(Protocol::Ip4(ip)) => is_local_ip(IpAddr::V4(ip)),
            Some(Protocol::Ip6(ip)) => is_local_ip(IpAddr::V6(ip)),
            Some(Protocol::Dns(host) | Protocol::Dns4(host) | Protocol::Dns6(host)) => {
                host == "localhost"
            }
            _ => false,
        }
    }

    pub fn memory_port(&self) -> Option<u64> {
        self.0.iter().find_map(|p| match p {
            Protocol::Memory(port) => Some(port),
            _ => None,
        })
    }
}

fn p2p_component(peer: &PeerId) -> Option<Protocol<'static>> {
    let mut multihash = Vec::with_capacity(2 + PEER_ID_LEN);
    multihash.push(IDENTITY_CODE);
    multihash.push(PEER_ID_LEN as u8);
    multihash.extend_from_slice(peer.as_bytes());
    libp2p_identity::PeerId::from_bytes(&multihash)
        .ok()
        .map(Protocol::P2p)
}

fn peer_from_component(id: &libp2p_identity::PeerId) -> Option<PeerId> {
    match id.to_bytes().as_slice() {
        [IDENTITY_CODE, len, digest @ ..] if *len as usize == PEER_ID_LEN => {
            PeerId::try_from_slice(digest).ok()
        }
        _ => None,
    }
}

fn is_local_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}

impl PartialOrd for DialAddress {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DialAddress {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.as_ref().cmp(other.0.as_ref())
    }
}

impl From<Multiaddr> for DialAddress {
    fn from(addr: Multiaddr) -> Self {
        Self(addr)
    }
}

impl From<DialAddress> for Multiaddr {
    fn from(addr: DialAddress) -> Self {
        addr.0
    }
}

impl fmt::Display for DialAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for DialAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let addr = Multiaddr::from_str(s).map_err(|e| AddressError::Invalid {
            address: s.to_string(),
            reason: e.to_string(),
        })?;
        if addr.is_empty() {
            return Err(AddressError::Empty);
        }
        Ok(Self(addr))
    }
}

impl Serialize for DialAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.collect_str(self)
        } else {
            self.0.to_vec().serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for DialAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        } else {
            let bytes = Vec::<u8>::deserialize(deserializer)?;
            Multiaddr::try_from(bytes)
                .map(Self)
                .map_err(serde::de::Error::custom)
        }
    }
}
