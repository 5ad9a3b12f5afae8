//! Relay server and client configuration

use std::time::Duration;

use indras_core::{DialAddress, ProtocolCategory};
use serde::{Deserialize, Serialize};

/// Policy and limits for a node serving as a relay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayServerConfig {
    /// Traffic categories this relay forwards. Each circuit carries exactly one.
    pub categories: Vec<ProtocolCategory>,
    pub max_reservations: usize,
    /// Upper bound on a granted reservation lifetime
    pub max_reservation_ttl_ms: u64,
    pub max_circuits_per_reservation: u32,
    pub max_circuit_bytes: u64,
    pub max_circuit_duration_ms: u64,
    /// Bytes forwarded to one reserved client before its reservation is revoked
    pub reservation_byte_quota: u64,
    pub address_cache_ttl_ms: u64,
    pub address_cache_capacity: usize,
    /// Deadline for a hop request and for the target's stop reply
    pub request_timeout_ms: u64,
    /// How often expired reservations and cache entries are swept
    pub sweep_interval_ms: u64,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        Self {
            categories: vec![ProtocolCategory::Control, ProtocolCategory::Application],
            max_reservations: 128,
            max_reservation_ttl_ms: 3_600_000,
            max_circuits_per_reservation: 16,
            max_circuit_bytes: 1 << 30,
            max_circuit_duration_ms: 3_600_000,
            reservation_byte_quota: 4 << 30,
            address_cache_ttl_ms: 600_000,
            address_cache_capacity: 1024,
            request_timeout_ms: 5_000,
            sweep_interval_ms: 10_000,
        }
    }
}

impl RelayServerConfig {
    /// A relay that only carries coordination traffic
    pub fn control_only() -> Self {
        Self {
            categories: vec![ProtocolCategory::Control],
            ..Self::default()
        }
    }

    /// A relay that only carries application traffic
    pub fn application_only() -> Self {
        Self {
            categories: vec![ProtocolCategory::Application],
            ..Self::default()
        }
    }

    pub fn serves(&self, category: ProtocolCategory) -> bool {
        self.categories.contains(&category)
    }

    pub fn max_reservation_ttl(&self) -> Duration {
        Duration::from_millis(self.max_reservation_ttl_ms)
    }

    pub fn max_circuit_duration(&self) -> Duration {
        Duration::from_millis(self.max_circuit_duration_ms)
    }

    pub fn address_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.address_cache_ttl_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn with_max_reservations(mut self, max: usize) -> Self {
        self.max_reservations = max;
        self
    }

    pub fn with_max_circuits_per_reservation(mut self, max: u32) -> Self {
        self.max_circuits_per_reservation = max;
        self
    }

    pub fn with_max_circuit_bytes(mut self, max: u64) -> Self {
        self.max_circuit_bytes = max;
        self
    }

    pub fn with_max_circuit_duration(mut self, max: Duration) -> Self {
        self.max_circuit_duration_ms = max.as_millis() as u64;
        self
    }

    pub fn with_reservation_byte_quota(mut self, quota: u64) -> Self {
        self.reservation_byte_quota = quota;
        self
    }

    pub fn with_max_reservation_ttl(mut self, ttl: Duration) -> Self {
        self.max_reservation_ttl_ms = ttl.as_millis() as u64;
        self
    }
}

/// Client-side reservation and circuit settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayClientConfig {
    /// Relays to reserve with, each naming the relay identity
    pub relays: Vec<DialAddress>,
    /// Lifetime requested for each reservation
    pub reservation_lifetime_ms: u64,
    /// Renew this long before the granted lifetime runs out
    pub renewal_window_ms: u64,
    /// Delay between renewal retries after a failure
    pub renewal_retry_ms: u64,
    /// Consecutive renewal failures before the reservation is dropped
    pub max_renewal_failures: u32,
    /// Deadline for a single hop request
    pub request_timeout_ms: u64,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            reservation_lifetime_ms: 600_000,
            renewal_window_ms: 120_000,
            renewal_retry_ms: 5_000,
            max_renewal_failures: 3,
            request_timeout_ms: 5_000,
        }
    }
}

impl RelayClientConfig {
    pub fn reservation_lifetime(&self) -> Duration {
        Duration::from_millis(self.reservation_lifetime_ms)
    }

    pub fn renewal_window(&self) -> Duration {
        Duration::from_millis(self.renewal_window_ms)
    }

    pub fn renewal_retry(&self) -> Duration {
        Duration::from_millis(self.renewal_retry_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn with_relays(mut self, relays: Vec<DialAddress>) -> Self {
        self.relays = relays;
        self
    }

    pub fn with_reservation_lifetime(mut self, lifetime: Duration) -> Self {
        self.reservation_lifetime_ms = lifetime.as_millis() as u64;
        self
    }

    pub fn with_renewal_window(mut self, window: Duration) -> Self {
        self.renewal_window_ms = window.as_millis() as u64;
        self
    }

    pub fn with_renewal_retry(mut self, retry: Duration) -> Self {
        self.renewal_retry_ms = retry.as_millis() as u64;
        self
    }

    pub fn with_max_renewal_failures(mut self, max: u32) -> Self {
        self.max_renewal_failures = max;
        self
    }

    /// When to renew a reservation granted for `granted`
    ///
    /// Never sooner than half the lifetime, so a window longer than the
    /// grant cannot turn renewal into a busy loop.
    pub fn renew_after(&self, granted: Duration) -> Duration {
        granted
            .saturating_sub(self.renewal_window())
            .max(granted / 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_roles() {
        let config = RelayServerConfig::control_only();
        assert!(config.serves(ProtocolCategory::Control));
        assert!(!config.serves(ProtocolCategory::Application));
        assert!(RelayServerConfig::default().serves(ProtocolCategory::Application));
    }

    #[test]
    fn test_renew_after_window() {
        let config = RelayClientConfig::default();
        assert_eq!(
            config.renew_after(Duration::from_secs(600)),
            Duration::from_secs(480)
        );
        // Window longer than the grant falls back to half the lifetime
        assert_eq!(
            config.renew_after(Duration::from_secs(60)),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: RelayServerConfig =
            serde_json::from_str(r#"{"max_reservations": 4}"#).unwrap();
        assert_eq!(config.max_reservations, 4);
        assert_eq!(config.max_circuits_per_reservation, 16);
    }
}
