//! # Indras Node
//!
//! Connection establishment for Indras Network.
//!
//! [`Node`] connects to peers by identity. Behind [`Node::connect`] the
//! [`DialCoordinator`] looks up candidate addresses, races direct dials,
//! falls back to a relay circuit, and lets the hole punch coordinator move
//! relayed connections onto a direct path while the caller keeps using the
//! same handle.
//!
//! ## Example
//!
//! ```rust,ignore
//! use indras_node::{Node, NodeConfig};
//!
//! let node = Node::builder(keypair, transport)
//!     .config(NodeConfig::from_toml_str(&config_text)?)
//!     .directory(directory)
//!     .nat(nat_detector)
//!     .build()?;
//! node.start().await?;
//!
//! let conn = node.connect(peer, Instant::now() + Duration::from_secs(10)).await?;
//! let stream = node.open_stream(&conn, "/chat/1").await?;
//!
//! let mut events = node.subscribe();
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

pub mod address_book;
mod config;
pub mod dial;
mod error;
mod node;

pub use address_book::{AddressBook, BookEntry, Trust};
pub use config::{DialConfig, NodeConfig};
pub use dial::{DialCoordinator, DialStats};
pub use error::{ConnectError, DialFailure, FailureReason, NodeError, NodeResult};
pub use node::{Node, NodeBuilder};
