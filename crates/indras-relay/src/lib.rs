//! # Indras Relay
//!
//! Relay layer for Indras Network. Relays serve three separable purposes:
//!
//! - **Address cache**: reserved clients publish their addresses, other
//!   clients may query them. Best effort, a miss means unknown.
//! - **Signaling**: a control circuit through the relay carries hole-punch
//!   coordination between peers that cannot reach each other yet
//!   ([`SignalingChannel`]).
//! - **Data relay**: application circuits forwarded to reserved clients as
//!   a last resort. Each circuit is a full [`Connection`](indras_transport::Connection)
//!   with its own multiplexer, not a single pipe.
//!
//! Relays serve control and application traffic through distinct roles
//! and refuse circuits whose declared protocol falls outside the category
//! they were asked to carry.
//!
//! ## Example
//!
//! ```rust,ignore
//! use indras_relay::{RelayClient, RelayClientConfig, APPLICATION_CIRCUIT_PROTOCOL};
//!
//! let (client, mut inbound) = RelayClient::new(local, upgrade, lifecycle, mux, config);
//! client.reserve(&relay_conn, listen_addrs).await?;
//!
//! let path = client
//!     .open_circuit(&relay_conn, target, APPLICATION_CIRCUIT_PROTOCOL, deadline)
//!     .await?;
//! ```

pub mod address_cache;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;
pub mod signaling;

pub use address_cache::AddressCache;
pub use client::{InboundCircuit, RelayClient, RelayEvent, Reservation};
pub use config::{RelayClientConfig, RelayServerConfig};
pub use error::{DenyReason, RelayError, SignalingError};
pub use protocol::{AddressRecord, ReservationGrant};
pub use server::{RelayServer, RelayServerStats};
pub use signaling::{SignalEnvelope, SignalingChannel};

/// Protocol declared for circuits that carry application streams
pub const APPLICATION_CIRCUIT_PROTOCOL: &str = "/circuit/app/1";
