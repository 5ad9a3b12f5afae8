//! Hole punch configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning for punch rounds and retries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HolePunchConfig {
    /// Whether relayed connections are upgraded at all
    pub enabled: bool,
    /// Rounds attempted per relayed connection
    pub max_attempts: u32,
    /// Deadline for one round, from signaling through path selection
    pub punch_timeout_ms: u64,
    /// Deadline for a single signaling exchange
    pub signaling_timeout_ms: u64,
    /// Wait before the second round; doubles for each further round
    pub retry_backoff_ms: u64,
    /// Spacing between repeated dials of one address within a round
    pub dial_interval_ms: u64,
}

impl Default for HolePunchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            punch_timeout_ms: 5_000,
            signaling_timeout_ms: 5_000,
            retry_backoff_ms: 2_000,
            dial_interval_ms: 50,
        }
    }
}

impl HolePunchConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn punch_timeout(&self) -> Duration {
        Duration::from_millis(self.punch_timeout_ms)
    }

    pub fn signaling_timeout(&self) -> Duration {
        Duration::from_millis(self.signaling_timeout_ms)
    }

    pub fn dial_interval(&self) -> Duration {
        Duration::from_millis(self.dial_interval_ms)
    }

    /// Wait after failed round `round` (1-based) before the next one
    pub fn backoff(&self, round: u32) -> Duration {
        let shift = round.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(1u64 << shift))
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_punch_timeout(mut self, timeout: Duration) -> Self {
        self.punch_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_signaling_timeout(mut self, timeout: Duration) -> Self {
        self.signaling_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff_ms = backoff.as_millis() as u64;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let config = HolePunchConfig::default().with_retry_backoff(Duration::from_millis(100));
        assert_eq!(config.backoff(1), Duration::from_millis(100));
        assert_eq!(config.backoff(2), Duration::from_millis(200));
        assert_eq!(config.backoff(3), Duration::from_millis(400));
    }

    #[test]
    fn test_partial_config() {
        let config: HolePunchConfig = serde_json::from_str(r#"{"max_attempts": 1}"#).unwrap();
        assert_eq!(config.max_attempts, 1);
        assert!(config.enabled);
        assert_eq!(config.punch_timeout(), Duration::from_secs(5));
    }
}
