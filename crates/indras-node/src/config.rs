//! Configuration for the node and its dial coordinator

use std::time::Duration;

use serde::{Deserialize, Serialize};

use indras_core::DialAddress;
use indras_holepunch::HolePunchConfig;
use indras_relay::{RelayClientConfig, RelayServerConfig};
use indras_transport::{LifecycleConfig, MuxConfig};

use crate::error::{NodeError, NodeResult};

/// Limits and deadlines applied while establishing connections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialConfig {
    /// Direct dial attempts raced at once for a single connect
    pub max_parallel_dials: usize,
    /// Dial attempts in flight across the whole node
    pub max_pending_dials: usize,
    /// Deadline for one transport dial, bounded by the connect deadline
    pub dial_timeout_ms: u64,
    /// How long looked-up addresses stay in the address book
    pub address_ttl_ms: u64,
    /// Addresses remembered per peer
    pub max_addresses_per_peer: usize,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            max_parallel_dials: 4,
            max_pending_dials: 64,
            dial_timeout_ms: 5_000,
            address_ttl_ms: 5 * 60 * 1000,
            max_addresses_per_peer: 16,
        }
    }
}

impl DialConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn address_ttl(&self) -> Duration {
        Duration::from_millis(self.address_ttl_ms)
    }

    pub fn with_max_parallel_dials(mut self, max: usize) -> Self {
        self.max_parallel_dials = max;
        self
    }

    pub fn with_max_pending_dials(mut self, max: usize) -> Self {
        self.max_pending_dials = max;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_address_ttl(mut self, ttl: Duration) -> Self {
        self.address_ttl_ms = ttl.as_millis() as u64;
        self
    }
}

/// Configuration for a [`Node`](crate::Node)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Addresses bound by [`Node::start`](crate::Node::start)
    pub listen: Vec<DialAddress>,
    pub dial: DialConfig,
    pub lifecycle: LifecycleConfig,
    pub mux: MuxConfig,
    /// Relays to reserve with and reservation timing
    pub relay: RelayClientConfig,
    /// Serve as a relay for other peers when set
    pub relay_server: Option<RelayServerConfig>,
    pub holepunch: HolePunchConfig,
}

impl NodeConfig {
    /// Parse a configuration from TOML. Missing sections take their defaults.
    pub fn from_toml_str(s: &str) -> NodeResult<Self> {
        toml::from_str(s).map_err(|e| NodeError::Config(e.to_string()))
    }

    pub fn with_listen(mut self, addr: DialAddress) -> Self {
        self.listen.push(addr);
        self
    }

    pub fn with_dial(mut self, dial: DialConfig) -> Self {
        self.dial = dial;
        self
    }

    pub fn with_lifecycle(mut self, lifecycle: LifecycleConfig) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    pub fn with_relay(mut self, relay: RelayClientConfig) -> Self {
        self.relay = relay;
        self
    }

    /// Offer relay service to other peers
    pub fn with_relay_server(mut self, server: RelayServerConfig) -> Self {
        self.relay_server = Some(server);
        self
    }

    pub fn with_holepunch(mut self, holepunch: HolePunchConfig) -> Self {
        self.holepunch = holepunch;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert!(config.listen.is_empty());
        assert!(config.relay_server.is_none());
        assert_eq!(config.dial.max_parallel_dials, 4);
        assert_eq!(config.dial.dial_timeout(), Duration::from_secs(5));
        assert!(config.holepunch.enabled);
    }

    #[test]
    fn test_from_toml() {
        let config = NodeConfig::from_toml_str(
            r#"
            listen = ["/memory/0"]

            [dial]
            max_parallel_dials = 2
            dial_timeout_ms = 750

            [holepunch]
            enabled = false

            [relay_server]
            max_reservations = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.listen, vec![DialAddress::memory(0)]);
        assert_eq!(config.dial.max_parallel_dials, 2);
        assert_eq!(config.dial.dial_timeout(), Duration::from_millis(750));
        // Unset fields keep their defaults
        assert_eq!(config.dial.max_pending_dials, 64);
        assert!(!config.holepunch.enabled);
        assert_eq!(config.relay_server.map(|s| s.max_reservations), Some(8));
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = NodeConfig::from_toml_str("listen = [\"not an address\"]").unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));
    }
}
