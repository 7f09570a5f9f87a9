//! Reconnection backoff policy.
//!
//! Shared by the connection manager: exponential delay, doubled per attempt
//! and capped at a maximum.

use std::time::Duration;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    pub base_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Maximum number of attempts (None = unlimited).
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: Some(10),
        }
    }
}

/// Delay before reconnect attempt `n` (1-indexed): `min(base * 2^(n-1), max)`.
pub fn reconnect_delay(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let delay = config.base_delay.saturating_mul(2u32.saturating_pow(exponent));
    delay.min(config.max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_attempt_uses_base_delay() {
        let config = ReconnectConfig::default();
        assert_eq!(reconnect_delay(1, &config), Duration::from_secs(1));
    }

    #[test]
    fn delay_doubles_then_caps() {
        let config = ReconnectConfig::default();

        // 1s, 2s, 4s, 8s, 16s, 30s (capped)
        assert_eq!(reconnect_delay(1, &config), Duration::from_secs(1));
        assert_eq!(reconnect_delay(2, &config), Duration::from_secs(2));
        assert_eq!(reconnect_delay(3, &config), Duration::from_secs(4));
        assert_eq!(reconnect_delay(4, &config), Duration::from_secs(8));
        assert_eq!(reconnect_delay(5, &config), Duration::from_secs(16));
        assert_eq!(reconnect_delay(6, &config), Duration::from_secs(30));
        assert_eq!(reconnect_delay(12, &config), Duration::from_secs(30));
    }

    #[test]
    fn custom_base_and_cap() {
        let config = ReconnectConfig {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
            max_attempts: None,
        };

        // 250ms, 500ms, 1s, 2s (capped)
        assert_eq!(reconnect_delay(1, &config), Duration::from_millis(250));
        assert_eq!(reconnect_delay(2, &config), Duration::from_millis(500));
        assert_eq!(reconnect_delay(3, &config), Duration::from_secs(1));
        assert_eq!(reconnect_delay(4, &config), Duration::from_secs(2));
        assert_eq!(reconnect_delay(5, &config), Duration::from_secs(2));
    }

    #[test]
    fn huge_attempt_does_not_overflow() {
        let config = ReconnectConfig::default();
        assert_eq!(reconnect_delay(u32::MAX, &config), Duration::from_secs(30));
    }
}
