//! Relay wire protocol
//!
//! Two stream protocols, both postcard frames with a length prefix:
//!
//! - hop (`/indras/relay/hop/1`): client to relay. Reservations, address
//!   queries, and circuit requests. A successful `Connect` turns the hop
//!   stream itself into the circuit's transport.
//! - stop (`/indras/relay/stop/1`): relay to the reserved target, announcing
//!   an inbound circuit. An `Accepted` reply turns the stop stream into the
//!   target's end of the circuit.

use std::time::Duration;

use indras_core::{DialAddress, PeerId, ProtocolCategory};
use serde::{Deserialize, Serialize};

use crate::error::DenyReason;

/// Client request on a hop stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HopRequest {
    /// Ask the relay to forward circuits to us, publishing our addresses
    Reserve {
        lifetime_ms: u64,
        addresses: Vec<DialAddress>,
    },
    /// Look up cached addresses for another identity
    QueryAddress { target: PeerId },
    /// Open a circuit to a reserved target
    Connect {
        target: PeerId,
        category: ProtocolCategory,
        protocol: String,
    },
}

/// Limits a relay attaches to a reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationGrant {
    /// Granted lifetime, never longer than requested
    pub lifetime_ms: u64,
    /// Concurrent circuits allowed to the reserved client
    pub max_circuits: u32,
    /// Bytes a single circuit may carry before it is closed
    pub max_circuit_bytes: u64,
    /// How long a single circuit may stay open
    pub max_circuit_duration_ms: u64,
    /// Total bytes across all circuits before the reservation is revoked
    pub byte_quota: u64,
}

impl ReservationGrant {
    pub fn lifetime(&self) -> Duration {
        Duration::from_millis(self.lifetime_ms)
    }

    pub fn max_circuit_duration(&self) -> Duration {
        Duration::from_millis(self.max_circuit_duration_ms)
    }
}

/// A cached address record, non-authoritative
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub peer: PeerId,
    pub addresses: Vec<DialAddress>,
    /// How long ago the relay learned these addresses
    pub age_ms: u64,
}

/// Relay reply on a hop stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HopResponse {
    Reserved(ReservationGrant),
    Address { record: Option<AddressRecord> },
    /// The circuit is open; raw circuit bytes follow on this stream
    Connected,
    Denied { reason: DenyReason },
}

/// Relay announcement on a stop stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StopRequest {
    Connect {
        source: PeerId,
        category: ProtocolCategory,
        protocol: String,
    },
}

/// Target reply on a stop stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StopResponse {
    Accepted,
    Rejected { reason: DenyReason },
}

#[cfg(test)]
mod tests {
    use indras_core::codec::{decode_frame, encode_frame};

    use super::*;

    #[test]
    fn test_connect_request_frame() {
        let req = HopRequest::Connect {
            target: PeerId::from_bytes([4; 32]),
            category: ProtocolCategory::Application,
            protocol: "/chat/1".into(),
        };
        let bytes = encode_frame(&req).unwrap();
        let decoded: HopRequest = decode_frame(&bytes).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_denied_response_frame() {
        let resp = HopResponse::Denied {
            reason: DenyReason::ProtocolNotPermitted,
        };
        let bytes = encode_frame(&resp).unwrap();
        assert_eq!(decode_frame::<HopResponse>(&bytes).unwrap(), resp);
    }
}
