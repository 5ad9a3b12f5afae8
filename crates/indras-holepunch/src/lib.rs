//! # Indras Hole Punch
//!
//! NAT traversal for Indras Network. Given a relayed [`Connection`], the
//! [`HolePunchCoordinator`] decides whether a punch can work for the NAT
//! pairing, coordinates a synchronized simultaneous dial over a signaling
//! circuit through the same relay, and on success moves the connection onto
//! the direct path in place. The relayed path is kept as a backup by the
//! lifecycle manager.
//!
//! Pairings where both peers sit behind address-dependent NATs are never
//! attempted; the relayed path simply stays.
//!
//! [`Connection`]: indras_transport::Connection

pub mod config;
pub mod coordinator;
pub mod error;
pub mod protocol;

pub use config::HolePunchConfig;
pub use coordinator::{HolePunchCoordinator, PunchState, PunchStats};
pub use error::PunchError;
pub use protocol::PunchMessage;
