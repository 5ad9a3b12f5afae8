//! # Indras Transport
//!
//! Session layer for Indras Network: everything between an authenticated
//! byte stream and a usable peer connection.
//!
//! ## Features
//!
//! - yamux stream multiplexing that runs over raw transports and, nested,
//!   over a single relayed stream
//! - Connection handles that survive relayed/direct path swaps
//! - Pooling keyed by verified identity
//! - Lifecycle management with idle reaping, backup retention and events
//!
//! ## Example
//!
//! ```rust,ignore
//! use indras_transport::{Connection, ConnectionPath, LifecycleConfig, LifecycleManager};
//! use indras_transport::mux::{MuxConfig, MuxSession, Role};
//!
//! let manager = LifecycleManager::new(LifecycleConfig::default());
//! let session = MuxSession::new(secured_io, Role::Dialer, MuxConfig::default());
//! let conn = manager.register(Connection::new(
//!     remote_peer,
//!     ConnectionPath::direct(session, local_addr, remote_addr),
//! ))?;
//! let stream = conn.open_stream("/chat/1").await?;
//! ```

pub mod connection;
pub mod error;
pub mod lifecycle;
pub mod mux;
pub mod pool;
pub mod protocol;

pub use connection::{Connection, ConnectionPath, ConnectionState, ConnectionStats};
pub use error::{ConnectionError, FramingError, MuxError, StreamError};
pub use lifecycle::{LifecycleConfig, LifecycleManager, StreamHandler};
pub use mux::{MuxConfig, MuxSession, MuxStats, Role, Stream};
pub use pool::ConnectionPool;
pub use protocol::MAX_PROTOCOL_LEN;
