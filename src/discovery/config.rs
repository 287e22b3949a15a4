//! Configuration and tuning constants for the discovery protocol.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::routing_table::DEFAULT_BUCKET_SIZE;

pub const DEFAULT_DISCOVERY_PORT: u16 = 30301;

/// Timer started on `Discovered -> PingSent`; no pong by then moves the peer to `Dead`.
pub const PING_TIMEOUT: Duration = Duration::from_secs(15);

/// Timer started on `Alive -> EvictCandidate`; the incumbent survives if its pong
/// arrives before this elapses.
pub const EVICT_TIMEOUT: Duration = Duration::from_secs(15);

/// A full bucket's stale entries (unmodified for this long) become eviction candidates.
pub const BUCKET_STALE: Duration = Duration::from_secs(120);

/// Period of the background routing-table refresh task.
pub const REFRESH_INTERVAL: Duration = Duration::from_millis(7_500);

/// Parallelism of an iterative `find_closest` lookup frontier.
pub const ALPHA: usize = 3;

/// Cycle budget for a single `find_closest` call before it gives up; every
/// `MAX_LOOP_NUM` iterations the target is replaced with the home ID to
/// exercise self-refresh.
pub const MAX_LOOP_NUM: usize = 10;

/// Grace period after a peer is marked `Dead` before it may be retried.
pub const RETRY_COOLDOWN: Duration = Duration::from_secs(30);

const fn default_bucket_size() -> usize {
    DEFAULT_BUCKET_SIZE
}

const fn default_discovery_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

#[derive(Debug, Clone, clap::Args, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Run in discovery-only (bootnode) mode: no channel pipeline is started.
    #[clap(name = "p2p-discovery-only", long)]
    #[serde(default)]
    pub discovery_only: bool,

    /// UDP port for the discovery protocol.
    #[clap(name = "discovery-port", long, default_value_t = default_discovery_port())]
    #[serde(default = "default_discovery_port")]
    pub port: u16,

    /// Hex-encoded secp256k1 secret key (32 bytes). A fresh key is generated if absent.
    #[clap(name = "discovery-private-key", long, env = "DISCOVERY_PRIVATE_KEY")]
    #[serde(default)]
    pub private_key: Option<String>,

    /// Bootstrap node URLs, `nodeid://<node_id_hex>@<ip>:<port>`.
    #[clap(name = "discovery-bootstrap", long)]
    #[serde(default)]
    pub bootstrap_nodes: Vec<String>,

    #[clap(name = "discovery-bucket-size", long, default_value_t = default_bucket_size())]
    #[serde(default = "default_bucket_size")]
    pub bucket_size: usize,

    #[clap(name = "disable-discovery", long)]
    #[serde(default)]
    pub disable: bool,

    /// Bind address for the UDP socket; defaults to `0.0.0.0:<port>`.
    #[clap(name = "discovery-bind-address", long)]
    #[serde(default)]
    pub bind_address: Option<String>,

    /// Protocol identifier carried in HELLO/PING/PONG; peers with a different value
    /// bond but are marked incompatible and dropped.
    #[clap(name = "network-id", long, default_value_t = 1)]
    #[serde(default = "default_network_id")]
    pub network_id: u8,

    #[clap(name = "network-version", long, default_value_t = 1)]
    #[serde(default = "default_network_version")]
    pub network_version: i16,
}

const fn default_network_id() -> u8 {
    1
}

const fn default_network_version() -> i16 {
    1
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            discovery_only: false,
            port: DEFAULT_DISCOVERY_PORT,
            private_key: None,
            bootstrap_nodes: Vec::new(),
            bucket_size: DEFAULT_BUCKET_SIZE,
            disable: false,
            bind_address: None,
            network_id: default_network_id(),
            network_version: default_network_version(),
        }
    }
}

impl DiscoveryConfig {
    pub fn get_bind_address(&self) -> String {
        self.bind_address
            .clone()
            .unwrap_or_else(|| format!("0.0.0.0:{}", self.port))
    }

    pub fn is_enabled(&self) -> bool {
        !self.disable
    }

    pub fn is_bootnode(&self) -> bool {
        self.discovery_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = DiscoveryConfig::default();
        assert!(!config.discovery_only);
        assert_eq!(config.port, DEFAULT_DISCOVERY_PORT);
        assert!(config.private_key.is_none());
        assert!(config.bootstrap_nodes.is_empty());
        assert_eq!(config.bucket_size, DEFAULT_BUCKET_SIZE);
        assert!(!config.disable);
        assert!(config.bind_address.is_none());
    }

    #[test]
    fn bind_address_default_and_custom() {
        let mut config = DiscoveryConfig::default();
        assert_eq!(config.get_bind_address(), format!("0.0.0.0:{DEFAULT_DISCOVERY_PORT}"));
        config.bind_address = Some("127.0.0.1:9999".to_string());
        assert_eq!(config.get_bind_address(), "127.0.0.1:9999");
    }

    #[test]
    fn enabled_and_bootnode_flags() {
        let mut config = DiscoveryConfig::default();
        assert!(config.is_enabled());
        assert!(!config.is_bootnode());
        config.disable = true;
        config.discovery_only = true;
        assert!(!config.is_enabled());
        assert!(config.is_bootnode());
    }
}
