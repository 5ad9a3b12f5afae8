//! # Indras Core
//!
//! Core types, collaborator traits, and errors for the Indras connectivity
//! stack.
//!
//! The connection-establishment crates above this one never talk to a real
//! network directly. They consume the traits defined here, which lets the
//! same dialing, relaying and hole-punching logic run against real
//! transports or the in-memory network in [`memory`].
//!
//! ## Key Types
//!
//! - [`PeerId`]: public-key-derived identity, the only valid connect target
//! - [`DialAddress`]: self-describing, possibly relay-qualified address
//! - [`NatType`]: NAT classification used to judge hole-punch feasibility
//! - [`ConnectionEvent`]: lifecycle notifications
//!
//! ## Key Traits
//!
//! - [`Transport`]: raw dial/listen with transport-level security
//! - [`AddressDirectory`]: candidate addresses for an identity
//! - [`NatDetector`]: local and remote NAT classification
//! - [`SecureUpgrade`]: identity proof over an arbitrary byte stream

pub mod address;
pub mod codec;
pub mod error;
pub mod event;
pub mod handshake;
pub mod identity;
pub mod memory;
pub mod nat;
pub mod protocol;
pub mod transport;

pub use address::*;
pub use error::*;
pub use event::*;
pub use handshake::SignedHandshake;
pub use identity::*;
pub use nat::*;
pub use protocol::*;
pub use transport::*;
