//! Connection lifecycle events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// Process-unique connection identifier
pub type ConnectionId = u64;

/// How a connection reaches its peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathKind {
    Direct,
    Relayed,
}

impl std::fmt::Display for PathKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PathKind::Direct => write!(f, "direct"),
            PathKind::Relayed => write!(f, "relayed"),
        }
    }
}

/// Role a connection plays for its peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionRole {
    /// The connection handed out to callers
    Primary,
    /// A relayed path retained after a direct upgrade
    Backup,
}

/// Why a connection went away
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// Closed explicitly by either side
    Closed,
    IdleTimeout,
    TransportError(String),
    /// The relay reservation carrying the circuit was lost
    ReservationLost,
    Shutdown,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::Closed => write!(f, "closed"),
            DisconnectReason::IdleTimeout => write!(f, "idle timeout"),
            DisconnectReason::TransportError(e) => write!(f, "transport error: {e}"),
            DisconnectReason::ReservationLost => write!(f, "reservation lost"),
            DisconnectReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Events emitted by the connection lifecycle manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// A verified connection was added to the pool
    Connected {
        peer: PeerId,
        conn_id: ConnectionId,
        path: PathKind,
        timestamp: DateTime<Utc>,
    },

    /// A connection left the pool
    Disconnected {
        peer: PeerId,
        conn_id: ConnectionId,
        reason: DisconnectReason,
        timestamp: DateTime<Utc>,
    },

    /// A relayed connection now runs over a direct path
    Upgraded {
        peer: PeerId,
        conn_id: ConnectionId,
        /// The retained relayed connection, if one was kept
        backup: Option<ConnectionId>,
        timestamp: DateTime<Utc>,
    },

    /// A direct path failed and the connection fell back to its backup relay
    Downgraded {
        peer: PeerId,
        conn_id: ConnectionId,
        timestamp: DateTime<Utc>,
    },

    /// The relay carrying this connection lost its reservation
    Degraded {
        peer: PeerId,
        conn_id: ConnectionId,
        relay: PeerId,
        timestamp: DateTime<Utc>,
    },
}

impl ConnectionEvent {
    pub fn peer(&self) -> PeerId {
        match self {
            ConnectionEvent::Connected { peer, .. }
            | ConnectionEvent::Disconnected { peer, .. }
            | ConnectionEvent::Upgraded { peer, .. }
            | ConnectionEvent::Downgraded { peer, .. }
            | ConnectionEvent::Degraded { peer, .. } => *peer,
        }
    }

    pub fn conn_id(&self) -> ConnectionId {
        match self {
            ConnectionEvent::Connected { conn_id, .. }
            | ConnectionEvent::Disconnected { conn_id, .. }
            | ConnectionEvent::Upgraded { conn_id, .. }
            | ConnectionEvent::Downgraded { conn_id, .. }
            | ConnectionEvent::Degraded { conn_id, .. } => *conn_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            ConnectionEvent::Connected { timestamp, .. }
            | ConnectionEvent::Disconnected { timestamp, .. }
            | ConnectionEvent::Upgraded { timestamp, .. }
            | ConnectionEvent::Downgraded { timestamp, .. }
            | ConnectionEvent::Degraded { timestamp, .. } => *timestamp,
        }
    }

    pub fn connected(peer: PeerId, conn_id: ConnectionId, path: PathKind) -> Self {
        Self::Connected {
            peer,
            conn_id,
            path,
            timestamp: Utc::now(),
        }
    }

    pub fn disconnected(peer: PeerId, conn_id: ConnectionId, reason: DisconnectReason) -> Self {
        Self::Disconnected {
            peer,
            conn_id,
            reason,
            timestamp: Utc::now(),
        }
    }

    pub fn upgraded(peer: PeerId, conn_id: ConnectionId, backup: Option<ConnectionId>) -> Self {
        Self::Upgraded {
            peer,
            conn_id,
            backup,
            timestamp: Utc::now(),
        }
    }

    pub fn downgraded(peer: PeerId, conn_id: ConnectionId) -> Self {
        Self::Downgraded {
            peer,
            conn_id,
            timestamp: Utc::now(),
        }
    }

    pub fn degraded(peer: PeerId, conn_id: ConnectionId, relay: PeerId) -> Self {
        Self::Degraded {
            peer,
            conn_id,
            relay,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_accessors() {
        let peer = PeerId::from_bytes([4; 32]);
        let event = ConnectionEvent::upgraded(peer, 7, Some(3));
        assert_eq!(event.peer(), peer);
        assert_eq!(event.conn_id(), 7);
        assert!(event.timestamp() <= Utc::now());
    }

    #[test]
    fn test_disconnect_reason_display() {
        let reason = DisconnectReason::TransportError("reset".into());
        assert_eq!(reason.to_string(), "transport error: reset");
        assert_eq!(PathKind::Relayed.to_string(), "relayed");
    }
}
