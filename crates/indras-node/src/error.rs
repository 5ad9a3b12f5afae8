//! Error types for the node and dial coordinator

use std::fmt;

use thiserror::Error;

use indras_core::{DialAddress, PeerId, TransportError};
use indras_relay::RelayError;
use indras_transport::{ConnectionError, StreamError};

/// Why one candidate address did not produce a connection
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FailureReason {
    #[error("{0}")]
    Transport(TransportError),

    /// The address answered with a different verified identity
    #[error("Reached {} instead", .0.short_id())]
    IdentityMismatch(PeerId),

    #[error("Relay circuit failed: {0}")]
    Relay(String),

    #[error("Attempt timed out")]
    Timeout,

    #[error("Not a usable address: {0}")]
    Unusable(String),

    #[error("Too many dials in flight")]
    DialLimit,
}

impl From<TransportError> for FailureReason {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::IdentityMismatch { actual, .. } => FailureReason::IdentityMismatch(actual),
            TransportError::Timeout => FailureReason::Timeout,
            other => FailureReason::Transport(other),
        }
    }
}

impl From<RelayError> for FailureReason {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::Upgrade(e) => e.into(),
            RelayError::Timeout => FailureReason::Timeout,
            other => FailureReason::Relay(other.to_string()),
        }
    }
}

/// One failed candidate, reported when every candidate failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialFailure {
    pub address: DialAddress,
    pub reason: FailureReason,
}

impl DialFailure {
    pub fn new(address: DialAddress, reason: impl Into<FailureReason>) -> Self {
        Self {
            address,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for DialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.address, self.reason)
    }
}

/// The single error a connect call surfaces
///
/// `Clone` so every caller converged on one attempt chain receives it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("No candidate addresses for {}", .0.short_id())]
    NoAddresses(PeerId),

    #[error("All {} candidate addresses failed: {}", .failures.len(), join_failures(.failures))]
    AllFailed { failures: Vec<DialFailure> },

    #[error("Identity mismatch: expected {}, reached {}", .expected.short_id(), .actual.short_id())]
    IdentityMismatch { expected: PeerId, actual: PeerId },

    #[error("Connect deadline elapsed")]
    Timeout,

    #[error("Connect cancelled")]
    Cancelled,

    #[error("Resource limit reached: {0}")]
    ResourceExhausted(String),

    #[error("Cannot connect to self")]
    SelfDial,

    #[error("Node is shutting down")]
    Shutdown,
}

fn join_failures(failures: &[DialFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl ConnectError {
    /// Whether retrying later could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConnectError::NoAddresses(_)
                | ConnectError::AllFailed { .. }
                | ConnectError::Timeout
                | ConnectError::ResourceExhausted(_)
        )
    }
}

impl From<ConnectionError> for ConnectError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::Shutdown => ConnectError::Shutdown,
            other => ConnectError::ResourceExhausted(other.to_string()),
        }
    }
}

/// Errors from node setup and the node facade
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Node already started")]
    AlreadyStarted,

    #[error("Node is shutting down")]
    Shutdown,
}

/// Result type alias for node operations
pub type NodeResult<T> = Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use indras_core::Keypair;

    use super::*;

    #[test]
    fn test_aggregate_lists_every_address() {
        let err = ConnectError::AllFailed {
            failures: vec![
                DialFailure::new(
                    DialAddress::memory(1),
                    TransportError::ConnectionRefused("/memory/1".into()),
                ),
                DialFailure::new(DialAddress::memory(2), FailureReason::Timeout),
            ],
        };
        let text = err.to_string();
        assert!(text.contains("/memory/1"));
        assert!(text.contains("/memory/2"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_identity_mismatch_is_not_retryable() {
        let expected = Keypair::generate().peer_id();
        let actual = Keypair::generate().peer_id();
        let err = ConnectError::IdentityMismatch { expected, actual };
        assert!(!err.is_retryable());

        let reason: FailureReason = TransportError::IdentityMismatch { expected, actual }.into();
        assert_eq!(reason, FailureReason::IdentityMismatch(actual));
    }
}
