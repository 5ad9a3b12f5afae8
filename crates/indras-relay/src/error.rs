//! Relay error types

use indras_core::{FramingError, PeerId, TransportError};
use indras_transport::StreamError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a relay (or a circuit target) refused a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
pub enum DenyReason {
    #[error("target holds no reservation")]
    NoReservation,

    #[error("target reservation expired")]
    ReservationExpired,

    /// The declared protocol is outside the categories this relay serves
    #[error("protocol category not permitted")]
    ProtocolNotPermitted,

    #[error("relay resource limit reached")]
    ResourceLimit,

    #[error("target unreachable from relay")]
    TargetUnreachable,

    #[error("target rejected the circuit")]
    TargetRejected,
}

/// Errors from relay clients and servers
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Relay denied request: {0}")]
    Denied(DenyReason),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Circuit upgrade failed: {0}")]
    Upgrade(#[from] TransportError),

    #[error("Unexpected relay message: {0}")]
    Protocol(String),

    #[error("Relay request timed out")]
    Timeout,

    #[error("No reservation held with relay {0}")]
    NotReserved(PeerId),

    #[error("Relay shut down")]
    Shutdown,
}

impl RelayError {
    /// Whether this failure should trigger a search for another relay
    pub fn is_reservation_failure(&self) -> bool {
        matches!(
            self,
            RelayError::Denied(
                DenyReason::NoReservation | DenyReason::ReservationExpired | DenyReason::ResourceLimit
            ) | RelayError::NotReserved(_)
        )
    }
}

/// Errors from a signaling channel
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalingError {
    #[error("Signaling channel closed")]
    Closed,

    #[error("No reply within the signaling timeout")]
    Timeout,

    #[error("Malformed signaling payload: {0}")]
    Codec(String),
}
