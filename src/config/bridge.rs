//! Engine-wide bridge settings
//!
//! Timeouts, buffer bounds and backoff shared by every transfer.

use std::time::Duration;

use serde::Deserialize;

/// Reconnect backoff for one leg
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay after the first failure
    #[serde(with = "humantime_serde")]
    pub initial: Duration,
    /// Ceiling for any single delay
    #[serde(with = "humantime_serde")]
    pub max: Duration,
    /// Symmetric jitter as a fraction of the delay (0.2 = ±20%)
    pub jitter: f64,
    /// Consecutive failures before the leg is reported unavailable (0 = never)
    pub max_failures: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: 0.2,
            max_failures: 5,
        }
    }
}

/// `[bridge]` section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Bound of the sink send queue and of the source-to-sink channel
    pub channel_capacity: usize,
    /// Connection/session establishment timeout, per attempt
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Bounded wait for in-flight publishes on completion
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
    /// How long sink backpressure may persist before the transfer fails
    #[serde(with = "humantime_serde")]
    pub backpressure_window: Duration,
    /// Unacknowledged QoS 1/2 publishes per connection
    pub max_inflight: u16,
    /// MQTT keep alive in seconds
    pub keep_alive: u16,
    pub backoff: BackoffConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1000,
            connect_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(5),
            backpressure_window: Duration::from_secs(30),
            max_inflight: 32,
            keep_alive: 60,
            backoff: BackoffConfig::default(),
        }
    }
}
