//! Tunables for bridges and the discovery registry.
//!
//! Everything is supplied programmatically; the defaults match what Hue
//! bridges tolerate in practice.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};

/// Per-bridge request and write pacing settings.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Timeout applied to requests that do not carry their own.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub request_timeout: Duration,
    /// Content type used for request bodies.
    pub content_type: String,
    /// Minimum spacing between two coalescer flush cycles.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub flush_interval: Duration,
    /// Number of requests kept in each bridge's history.
    pub history_size: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            request_timeout: Duration::from_secs(5),
            content_type: String::from("application/json;charset=utf-8"),
            flush_interval: Duration::from_millis(200),
            history_size: 100,
        }
    }
}

/// Discovery and eviction settings for a [`crate::Registry`].
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// SSDP service type searched for.
    pub service_type: String,
    /// How long one SSDP search listens for answers.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub search_window: Duration,
    /// Quiet period that ends a cycle before any bridge was seen.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub initial_quiet_period: Duration,
    /// Quiet period that ends a cycle after activity.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub quiet_period: Duration,
    /// Cycles an unsubscribed bridge may be missing before it is dropped.
    pub max_bridge_age: u32,
    /// Cycles a subscribed bridge may be missing before it is dropped.
    ///
    /// Much larger than `max_bridge_age`: a subscribed bridge is polled on
    /// its own, and its refresh failures are the better liveness signal.
    pub max_subscribed_age: u32,
    /// Consecutive refresh failures tolerated before a bridge is dropped.
    pub max_bridge_errors: u32,
    /// Settings handed to every bridge the registry creates.
    pub bridge: BridgeConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            service_type: String::from("upnp:rootdevice"),
            search_window: Duration::from_secs(3),
            initial_quiet_period: Duration::from_secs(5),
            quiet_period: Duration::from_secs(2),
            max_bridge_age: 5,
            max_subscribed_age: 100,
            max_bridge_errors: 2,
            bridge: BridgeConfig::default(),
        }
    }
}
