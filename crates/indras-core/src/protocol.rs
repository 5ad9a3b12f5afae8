//! Protocol hints and traffic categories
//!
//! Every stream is opened with a protocol hint. Hints under the
//! `/indras/` namespace are control traffic handled by the stack itself;
//! anything else belongs to the application.

use serde::{Deserialize, Serialize};

/// Relay hop protocol: reservations, address queries, circuit requests
pub const RELAY_HOP_PROTOCOL: &str = "/indras/relay/hop/1";

/// Relay stop protocol: the relay announcing an inbound circuit to its target
pub const RELAY_STOP_PROTOCOL: &str = "/indras/relay/stop/1";

/// Hole-punch coordination, carried over a signaling circuit
pub const HOLEPUNCH_PROTOCOL: &str = "/indras/holepunch/1";

const CONTROL_PREFIX: &str = "/indras/";

/// Class of traffic a protocol belongs to
///
/// Relays serve the two categories through distinct roles and never mix them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolCategory {
    /// Coordination traffic: signaling, hole punching, relay control
    Control,
    /// Application traffic
    Application,
}

impl ProtocolCategory {
    pub fn of(protocol: &str) -> Self {
        if protocol.starts_with(CONTROL_PREFIX) {
            ProtocolCategory::Control
        } else {
            ProtocolCategory::Application
        }
    }
}

impl std::fmt::Display for ProtocolCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolCategory::Control => write!(f, "control"),
            ProtocolCategory::Application => write!(f, "application"),
        }
    }
}

/// Whether a protocol hint is handled internally rather than surfaced to the application
pub fn is_internal(protocol: &str) -> bool {
    ProtocolCategory::of(protocol) == ProtocolCategory::Control
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(ProtocolCategory::of(HOLEPUNCH_PROTOCOL), ProtocolCategory::Control);
        assert_eq!(ProtocolCategory::of(RELAY_HOP_PROTOCOL), ProtocolCategory::Control);
        assert_eq!(ProtocolCategory::of("/chat/1"), ProtocolCategory::Application);
        assert!(!is_internal("/indras-chat/1"));
    }
}
