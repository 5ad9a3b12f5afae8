//! Transport layer error types

pub use indras_core::error::FramingError;

use indras_core::ProtocolCategory;
use thiserror::Error;

/// Errors from opening or using a stream
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    /// The connection is closing or already closed
    #[error("Connection is closing")]
    ConnectionClosing,

    #[error("Stream limit reached ({max} open streams)")]
    StreamLimit { max: usize },

    #[error("Protocol hint too long: {len} bytes (max {max})")]
    ProtocolTooLong { len: usize, max: usize },

    /// A relayed circuit only carries traffic of the category it was opened for
    #[error("Protocol category {requested} not permitted on a {carried} circuit")]
    CategoryMismatch {
        requested: ProtocolCategory,
        carried: ProtocolCategory,
    },

    #[error("Stream reset by peer")]
    Reset,
}

/// Session-level multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    /// A stream header could not be read
    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Timed out waiting for a stream header")]
    HintTimeout,

    #[error("yamux: {0}")]
    Connection(#[from] yamux::ConnectionError),
}

/// Errors from the connection pool and lifecycle manager
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("Too many connections: {current}/{max}")]
    TooManyConnections { current: usize, max: usize },

    #[error("Connection not found: {0}")]
    NotFound(u64),

    #[error("Lifecycle manager shut down")]
    Shutdown,
}
