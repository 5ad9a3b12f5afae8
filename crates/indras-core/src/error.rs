//! Error types shared across the connectivity stack

use thiserror::Error;

use crate::identity::PeerId;

/// Errors related to peer identity
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("Invalid identity format: {0}")]
    InvalidFormat(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Signature verification failed")]
    InvalidSignature,
}

/// Errors produced while parsing a dial address
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("Empty address")]
    Empty,

    #[error("Invalid address {address}: {reason}")]
    Invalid { address: String, reason: String },
}

/// Errors returned by the raw transport and security collaborators
///
/// Kept `Clone` so per-address failures can be collected and reported
/// in aggregate.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Unsupported address: {0}")]
    Unsupported(String),

    #[error("Address unreachable: {0}")]
    Unreachable(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Dial timed out")]
    Timeout,

    #[error("Security handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Identity mismatch: expected {expected}, got {actual}")]
    IdentityMismatch { expected: PeerId, actual: PeerId },

    #[error("Address already in use: {0}")]
    AddressInUse(String),

    #[error("Listener closed")]
    ListenerClosed,

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// Errors that can occur while reading or writing length-prefixed frames
#[derive(Debug, Error)]
pub enum FramingError {
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Insufficient data: need {needed} bytes, have {available}")]
    InsufficientData { needed: usize, available: usize },

    #[error("Stream closed before a full frame arrived")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

impl From<FramingError> for TransportError {
    fn from(e: FramingError) -> Self {
        TransportError::HandshakeFailed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_error_display() {
        let err = IdentityError::InvalidKeyLength {
            expected: 32,
            actual: 16,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("32"));
        assert!(msg.contains("16"));
    }

    #[test]
    fn test_transport_error_mismatch_names_both_peers() {
        let expected = PeerId::from_bytes([1; 32]);
        let actual = PeerId::from_bytes([2; 32]);
        let msg = TransportError::IdentityMismatch { expected, actual }.to_string();
        assert!(msg.contains(&expected.to_string()));
        assert!(msg.contains(&actual.to_string()));
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone");
        let err: TransportError = io.into();
        assert!(matches!(err, TransportError::Io(ref s) if s.contains("pipe gone")));
    }
}
