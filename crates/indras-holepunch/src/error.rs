//! Hole punch error types

use indras_core::{FramingError, NatType, PeerId};
use indras_relay::{RelayError, SignalingError};
use indras_transport::{ConnectionError, StreamError};
use thiserror::Error;

/// Why a hole punch did not produce a direct path
#[derive(Debug, Error)]
pub enum PunchError {
    /// Policy outcome, not a fault: the NAT pairing cannot be punched
    #[error("Hole punch infeasible between {local:?} and {remote:?} NATs")]
    Infeasible { local: NatType, remote: NatType },

    #[error("Hole punch timed out")]
    Timeout,

    #[error("Signaling failed: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Signaling circuit failed: {0}")]
    Relay(#[from] RelayError),

    #[error("No relay connection to {}", .0.short_id())]
    NoRelay(PeerId),

    #[error("Connection is not relayed")]
    NotRelayed,

    #[error("Hole punching is disabled")]
    Disabled,

    #[error("Hole punch already in progress")]
    InProgress,

    #[error("Peer advertised no direct addresses")]
    NoCandidates,

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Remote side abandoned the round")]
    Abandoned,

    #[error("Could not adopt direct path: {0}")]
    Lifecycle(#[from] ConnectionError),

    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error("Hole punch cancelled")]
    Cancelled,
}

impl PunchError {
    /// Whether another round could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PunchError::Timeout
                | PunchError::Signaling(_)
                | PunchError::Relay(_)
                | PunchError::NoCandidates
                | PunchError::Stream(_)
                | PunchError::Framing(_)
                | PunchError::Abandoned
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infeasible_is_final() {
        let err = PunchError::Infeasible {
            local: NatType::AddressDependent,
            remote: NatType::AddressDependent,
        };
        assert!(!err.is_retryable());
        assert!(PunchError::Timeout.is_retryable());
        assert!(!PunchError::Cancelled.is_retryable());
    }
}
